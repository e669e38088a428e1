//! Single-attempt fetch-and-save of one module version.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::errors::{Error, Op, Result};
use crate::metrics::{Metrics, Outcome, OutcomeLabels};
use crate::storage::Backend;
use crate::upstream::Protocol;

use super::Stasher;

const FETCH_OP: Op = "stash.Fetch";
const SAVE_OP: Op = "stash.Save";

/// Pulls a full version bundle from upstream and writes it to storage.
///
/// No retries happen here; callers own the retry policy.  The fetch and the
/// save share one deadline measured from the start of the call.
pub struct FetchStasher {
    upstream: Arc<dyn Protocol>,
    storage: Arc<dyn Backend>,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl FetchStasher {
    pub fn new(upstream: Arc<dyn Protocol>, storage: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self {
            upstream,
            storage,
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn fetch_and_save(&self, module: &str, version: &str) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let timed_out = || {
            Error::Upstream(format!(
                "stashing {module}@{version} exceeded {:?}",
                self.timeout
            ))
        };

        let bundle = timeout_at(deadline, self.upstream.version(module, version))
            .await
            .map_err(|_| Error::op(FETCH_OP, timed_out()))?
            .map_err(|e| Error::op(FETCH_OP, e))?;

        // The zip moves into `save`, which drops it on every path.
        timeout_at(
            deadline,
            self.storage
                .save(module, version, bundle.go_mod, bundle.zip, bundle.info),
        )
        .await
        .map_err(|_| Error::op(SAVE_OP, timed_out()))?
        .map_err(|e| Error::op(SAVE_OP, e))
    }
}

#[async_trait::async_trait]
impl Stasher for FetchStasher {
    #[instrument(skip(self))]
    async fn stash(&self, module: &str, version: &str) -> Result<()> {
        let start = std::time::Instant::now();
        let result = self.fetch_and_save(module, version).await;

        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() {
                Outcome::Success
            } else {
                Outcome::Failure
            };
            metrics
                .stash_total
                .get_or_create(&OutcomeLabels { outcome })
                .inc();
            metrics
                .stash_duration_seconds
                .observe(start.elapsed().as_secs_f64());
        }

        match &result {
            Ok(()) => debug!(elapsed = ?start.elapsed(), "stashed"),
            Err(e) => warn!(error = %e, "stash failed"),
        }
        result
    }
}
