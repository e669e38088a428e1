//! Fleet-wide stash deduplication through a KeyDB lock.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::coordination::locks::{stash_lock_key, DistributedLock};
use crate::errors::{Error, Op, Result};
use crate::metrics::Metrics;
use crate::storage::Backend;

use super::Stasher;

const OP: Op = "stash.Locked";

/// Wraps a stasher so that at most one node in the fleet stashes a given
/// version at a time.
///
/// A node that finds the lock held waits for it, then checks storage: if the
/// holder persisted the version, there is nothing left to do.
pub struct LockedStasher {
    inner: Arc<dyn Stasher>,
    storage: Arc<dyn Backend>,
    lock: Arc<dyn DistributedLock>,
    node_id: String,
    lock_ttl: u64,
    wait_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl LockedStasher {
    pub fn new(
        inner: Arc<dyn Stasher>,
        storage: Arc<dyn Backend>,
        lock: Arc<dyn DistributedLock>,
        node_id: String,
        lock_ttl: u64,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            storage,
            lock,
            node_id,
            lock_ttl,
            wait_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn already_stored(&self, module: &str, version: &str) -> Result<bool> {
        self.storage
            .exists(module, version)
            .await
            .map_err(|e| Error::op(OP, e))
    }

    async fn stash_locked(&self, module: &str, version: &str) -> Result<()> {
        if self.already_stored(module, version).await? {
            debug!("version already stored, skipping fetch");
            return Ok(());
        }
        self.inner.stash(module, version).await
    }
}

fn coordination_err(err: anyhow::Error) -> Error {
    Error::op(OP, Error::Internal(format!("{err:#}")))
}

#[async_trait::async_trait]
impl Stasher for LockedStasher {
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    async fn stash(&self, module: &str, version: &str) -> Result<()> {
        let key = stash_lock_key(module, version);

        loop {
            let acquired = self
                .lock
                .acquire(&key, &self.node_id, self.lock_ttl)
                .await
                .map_err(coordination_err)?;
            if acquired {
                break;
            }

            info!(%key, "stash lock held by another node, waiting");
            if let Some(metrics) = &self.metrics {
                metrics.lock_waits.inc();
            }

            let released = self
                .lock
                .wait_released(&key, self.wait_timeout)
                .await
                .map_err(coordination_err)?;
            if !released {
                if let Some(metrics) = &self.metrics {
                    metrics.lock_timeouts.inc();
                }
                return Err(Error::op(
                    OP,
                    Error::Upstream(format!(
                        "timed out after {:?} waiting for stash lock {key}",
                        self.wait_timeout
                    )),
                ));
            }

            if self.already_stored(module, version).await? {
                debug!("another node stored the version while we waited");
                return Ok(());
            }
        }

        let result = self.stash_locked(module, version).await;

        if let Err(e) = self.lock.release(&key, &self.node_id).await {
            warn!(%key, error = %e, "failed to release stash lock; it will expire");
        }
        result
    }
}
