//! Persistent artifact storage.
//!
//! A [`Backend`] holds `.info`, `.mod` and `.zip` artifacts keyed by module
//! version.  Absent artifacts always surface as [`Error::NotFound`] so the
//! cache layer can tell a miss from a broken backend.
//!
//! [`Error::NotFound`]: crate::errors::Error::NotFound

pub mod disk;
pub mod memory;
pub mod s3;

use bytes::Bytes;

use crate::errors::{Error, Result};
use crate::module::ZipArchive;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Versions of `module` present in storage.
    async fn list(&self, module: &str) -> Result<Vec<String>>;

    /// Whether a complete version is stored.
    async fn exists(&self, module: &str, version: &str) -> Result<bool>;

    async fn info(&self, module: &str, version: &str) -> Result<Bytes>;

    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes>;

    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive>;

    /// Persist one version.  Saving a version that is already stored
    /// overwrites it with identical content.
    async fn save(
        &self,
        module: &str,
        version: &str,
        go_mod: Bytes,
        zip: ZipArchive,
        info: Bytes,
    ) -> Result<()>;
}

/// Reject module paths and versions that could escape a storage root.
pub(crate) fn validate_key(module: &str, version: &str) -> Result<()> {
    let bad_module = module
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    let bad_version = version.is_empty() || version.contains('/') || version == "..";
    if bad_module || bad_version {
        return Err(Error::Storage(format!(
            "invalid module key {module}@{version}"
        )));
    }
    Ok(())
}
