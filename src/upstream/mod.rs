//! Upstream protocol abstraction.
//!
//! [`Protocol`] is the read surface of a module repository: the origin proxy
//! implements it, and so does the cache-first decorator in
//! [`crate::download`] that fronts it.

pub mod goproxy;

use bytes::Bytes;

use crate::errors::Result;
use crate::module::{RevInfo, VersionBundle, ZipArchive};

pub use goproxy::GoProxy;

#[async_trait::async_trait]
pub trait Protocol: Send + Sync {
    /// All known versions of `module`.
    async fn list(&self, module: &str) -> Result<Vec<String>>;

    /// Raw `.info` document for a version.
    async fn info(&self, module: &str, version: &str) -> Result<Bytes>;

    /// Latest known revision of `module`.
    async fn latest(&self, module: &str) -> Result<RevInfo>;

    /// Raw `go.mod` file for a version.
    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes>;

    /// Source archive for a version.
    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive>;

    /// Info, go.mod and zip together.
    async fn version(&self, module: &str, version: &str) -> Result<VersionBundle>;
}
