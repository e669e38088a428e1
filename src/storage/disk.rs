//! Local-disk storage backend.
//!
//! Layout: `{root}/{escaped module}/@v/{escaped version}.{info,mod,zip}`.
//! Every file is written to a temp file in the same directory and renamed
//! into place, and `.info` is written last, so a version is only visible
//! once it is complete.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::errors::{Error, Result};
use crate::module::{escape_path, unescape_path, ZipArchive};

use super::{validate_key, Backend};

#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn version_dir(&self, module: &str) -> PathBuf {
        self.root.join(escape_path(module)).join("@v")
    }

    fn artifact_path(&self, module: &str, version: &str, ext: &str) -> Result<PathBuf> {
        validate_key(module, version)?;
        Ok(self
            .version_dir(module)
            .join(format!("{}.{ext}", escape_path(version))))
    }

    async fn read(&self, module: &str, version: &str, ext: &str) -> Result<Bytes> {
        let path = self.artifact_path(module, version, ext)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) => Err(map_read_err(e, module, version)),
        }
    }
}

fn map_read_err(err: io::Error, module: &str, version: &str) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::not_found(module, version)
    } else {
        Error::Storage(format!("read {module}@{version}: {err}"))
    }
}

/// Write `data` to `dest` through a temp file in the same directory.
async fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<()> {
    let tmp = tempfile::NamedTempFile::new_in(dir)?.into_temp_path();
    tokio::fs::write(&tmp, data).await?;
    tmp.persist(dest).map_err(|e| Error::from(e.error))?;
    Ok(())
}

#[async_trait::async_trait]
impl Backend for DiskStorage {
    async fn list(&self, module: &str) -> Result<Vec<String>> {
        let dir = self.version_dir(module);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(escaped) = name.strip_suffix(".info") {
                if let Some(version) = unescape_path(escaped) {
                    versions.push(version);
                }
            }
        }
        versions.sort();
        Ok(versions)
    }

    async fn exists(&self, module: &str, version: &str) -> Result<bool> {
        let path = self.artifact_path(module, version, "info")?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        self.read(module, version, "info").await
    }

    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        self.read(module, version, "mod").await
    }

    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        let path = self.artifact_path(module, version, "zip")?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| map_read_err(e, module, version))?;
        let size = file.metadata().await?.len();
        Ok(ZipArchive::new(Box::new(file), Some(size)))
    }

    #[instrument(skip(self, go_mod, zip, info))]
    async fn save(
        &self,
        module: &str,
        version: &str,
        go_mod: Bytes,
        zip: ZipArchive,
        info: Bytes,
    ) -> Result<()> {
        let dir = self.version_dir(module);
        let zip_path = self.artifact_path(module, version, "zip")?;
        let mod_path = self.artifact_path(module, version, "mod")?;
        let info_path = self.artifact_path(module, version, "info")?;

        tokio::fs::create_dir_all(&dir).await?;

        let tmp = tempfile::NamedTempFile::new_in(&dir)?.into_temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut reader = zip.into_reader();
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);
        tmp.persist(&zip_path).map_err(|e| Error::from(e.error))?;

        write_atomic(&dir, &mod_path, &go_mod).await?;
        write_atomic(&dir, &info_path, &info).await?;

        debug!(zip_bytes = written, "version saved to disk");
        Ok(())
    }
}
