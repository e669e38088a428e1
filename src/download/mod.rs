//! Client-facing download protocol.

pub mod cache_first;

pub use cache_first::CacheFirst;
