//! Fetch-and-persist of one module version ("stashing").
//!
//! The layers compose from the inside out:
//!
//! - [`FetchStasher`] pulls a [`VersionBundle`] from upstream and saves it,
//!   once, under a hard deadline.
//! - [`LockedStasher`] takes a fleet-wide KeyDB lock so only one node fetches
//!   a given version at a time.
//! - [`Singleflight`] collapses concurrent callers in this process onto one
//!   execution and hands all of them the same result.
//!
//! [`VersionBundle`]: crate::module::VersionBundle

pub mod fetch;
pub mod locked;
pub mod singleflight;

use crate::errors::Result;

pub use fetch::FetchStasher;
pub use locked::LockedStasher;
pub use singleflight::Singleflight;

#[async_trait::async_trait]
pub trait Stasher: Send + Sync {
    /// Fetch `module@version` from upstream and persist it to storage.
    async fn stash(&self, module: &str, version: &str) -> Result<()>;
}
