//! Fleet coordination backed by KeyDB (Redis-compatible).
//!
//! Several proxy instances share one KeyDB: it holds the per-version stash
//! locks that keep two nodes from fetching the same artifact, and the job
//! list that any node's workers may drain.

pub mod locks;
pub mod node;
pub mod redis;
