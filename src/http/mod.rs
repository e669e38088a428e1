//! HTTP layer for the module proxy.
//!
//! Parses Go module proxy paths and serves them through the cache-first
//! protocol, alongside the health and metrics endpoints.

pub mod handler;
pub mod paths;
