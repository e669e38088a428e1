//! Storage-first [`Protocol`] that stashes from upstream on a miss.
//!
//! `list` and `latest` describe mutable upstream state and always go to
//! upstream.  Single artifacts are read from storage; a NotFound read
//! triggers one blocking stash for the version and a second read.  Any other
//! failure is returned tagged with the accessor that hit it.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::errors::{Error, Op, Result};
use crate::filter::FilterPolicy;
use crate::metrics::{Artifact, Metrics};
use crate::module::{RevInfo, VersionBundle, ZipArchive};
use crate::stash::Stasher;
use crate::storage::Backend;
use crate::upstream::Protocol;

pub struct CacheFirst {
    upstream: Arc<dyn Protocol>,
    storage: Arc<dyn Backend>,
    stasher: Arc<dyn Stasher>,
    filter: Option<Arc<dyn FilterPolicy>>,
    metrics: Option<Arc<Metrics>>,
}

impl CacheFirst {
    pub fn new(
        upstream: Arc<dyn Protocol>,
        storage: Arc<dyn Backend>,
        stasher: Arc<dyn Stasher>,
    ) -> Self {
        Self {
            upstream,
            storage,
            stasher,
            filter: None,
            metrics: None,
        }
    }

    /// Never stash modules the filter excludes; their misses stay misses.
    pub fn with_filter(mut self, filter: Arc<dyn FilterPolicy>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn should_stash(&self, module: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.should_process(module))
    }

    /// Read from storage, stashing once and re-reading on a NotFound.
    async fn read_through<T, F, Fut>(
        &self,
        op: Op,
        artifact: Artifact,
        module: &str,
        version: &str,
        read: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match read().await {
            Ok(value) => {
                if let Some(metrics) = &self.metrics {
                    metrics.hit(artifact);
                }
                Ok(value)
            }
            Err(err) if err.is_not_found() => {
                if let Some(metrics) = &self.metrics {
                    metrics.miss(artifact);
                }
                if !self.should_stash(module) {
                    debug!(%module, %version, "miss on excluded module, not stashing");
                    return Err(Error::op(op, err));
                }
                debug!(%module, %version, "storage miss, stashing from upstream");
                self.stasher
                    .stash(module, version)
                    .await
                    .map_err(|e| Error::op(op, e))?;
                read().await.map_err(|e| Error::op(op, e))
            }
            Err(err) => Err(Error::op(op, err)),
        }
    }
}

#[async_trait::async_trait]
impl Protocol for CacheFirst {
    async fn list(&self, module: &str) -> Result<Vec<String>> {
        self.upstream
            .list(module)
            .await
            .map_err(|e| Error::op("cachefirst.List", e))
    }

    #[instrument(skip(self))]
    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        self.read_through("cachefirst.Info", Artifact::Info, module, version, || {
            self.storage.info(module, version)
        })
        .await
    }

    async fn latest(&self, module: &str) -> Result<RevInfo> {
        self.upstream
            .latest(module)
            .await
            .map_err(|e| Error::op("cachefirst.Latest", e))
    }

    #[instrument(skip(self))]
    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        self.read_through("cachefirst.GoMod", Artifact::Mod, module, version, || {
            self.storage.go_mod(module, version)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        self.read_through("cachefirst.Zip", Artifact::Zip, module, version, || {
            self.storage.zip(module, version)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn version(&self, module: &str, version: &str) -> Result<VersionBundle> {
        const OP: Op = "cachefirst.Version";
        let info = self.info(module, version).await.map_err(|e| Error::op(OP, e))?;
        let go_mod = self
            .go_mod(module, version)
            .await
            .map_err(|e| Error::op(OP, e))?;
        // A resolved info/go.mod means the whole bundle was saved together.
        let zip = self
            .storage
            .zip(module, version)
            .await
            .map_err(|e| Error::op(OP, e))?;
        Ok(VersionBundle { info, go_mod, zip })
    }
}
