//! In-process storage backend.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::errors::{Error, Result};
use crate::module::{fmt_mod_ver, ZipArchive};

use super::{validate_key, Backend};

#[derive(Debug, Clone)]
struct Stored {
    module: String,
    version: String,
    info: Bytes,
    go_mod: Bytes,
    zip: Bytes,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Stored>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored versions.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, module: &str, version: &str) -> Result<Stored> {
        self.entries
            .read()
            .get(&fmt_mod_ver(module, version))
            .cloned()
            .ok_or_else(|| Error::not_found(module, version))
    }
}

#[async_trait::async_trait]
impl Backend for MemoryStorage {
    async fn list(&self, module: &str) -> Result<Vec<String>> {
        let mut versions: Vec<String> = self
            .entries
            .read()
            .values()
            .filter(|s| s.module == module)
            .map(|s| s.version.clone())
            .collect();
        versions.sort();
        Ok(versions)
    }

    async fn exists(&self, module: &str, version: &str) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .contains_key(&fmt_mod_ver(module, version)))
    }

    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        Ok(self.get(module, version)?.info)
    }

    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        Ok(self.get(module, version)?.go_mod)
    }

    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        Ok(ZipArchive::from_bytes(self.get(module, version)?.zip))
    }

    async fn save(
        &self,
        module: &str,
        version: &str,
        go_mod: Bytes,
        zip: ZipArchive,
        info: Bytes,
    ) -> Result<()> {
        validate_key(module, version)?;
        let zip = zip.read_all().await?;
        self.entries.write().insert(
            fmt_mod_ver(module, version),
            Stored {
                module: module.to_string(),
                version: version.to_string(),
                info,
                go_mod,
                zip,
            },
        );
        Ok(())
    }
}
