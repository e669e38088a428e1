use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::errors::{Error, Op, Result};
use crate::filter::FilterPolicy;
use crate::metrics::{JobKind, JobLabels, Metrics};
use crate::stash::Stasher;

use super::{Job, WorkQueue};

const OP: Op = "jobs.FetchCacheMiss";

/// Stashes a reported miss in the background, re-queueing itself with one
/// less try on failure until the budget reaches zero.
pub struct CacheMissFetcher {
    stasher: Arc<dyn Stasher>,
    queue: Arc<dyn WorkQueue>,
    filter: Arc<dyn FilterPolicy>,
    metrics: Option<Arc<Metrics>>,
}

impl CacheMissFetcher {
    pub fn new(
        stasher: Arc<dyn Stasher>,
        queue: Arc<dyn WorkQueue>,
        filter: Arc<dyn FilterPolicy>,
    ) -> Self {
        Self {
            stasher,
            queue,
            filter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one attempt.  `try_count` is the number of retries left after
    /// this one.  The stash error is returned even when a retry was queued.
    #[instrument(skip(self))]
    pub async fn handle(&self, module: &str, version: &str, try_count: u32) -> Result<()> {
        if !self.filter.should_process(module) {
            return Err(Error::op(OP, Error::Excluded(module.to_string())));
        }

        let err = match self.stasher.stash(module, version).await {
            Ok(()) => {
                info!("background fetch stored version");
                return Ok(());
            }
            Err(e) => Error::op(OP, e),
        };

        if try_count == 0 {
            warn!(error = %err, "fetch retries exhausted, dropping job");
            if let Some(metrics) = &self.metrics {
                metrics
                    .jobs_dropped
                    .get_or_create(&JobLabels { job: JobKind::Fetch })
                    .inc();
            }
            return Err(err);
        }

        if !self.filter.should_process(module) {
            debug!("module excluded since the attempt started, not retrying");
            return Err(err);
        }

        match self
            .queue
            .enqueue(Job::fetch(module, version, try_count - 1))
            .await
        {
            Ok(()) => {
                debug!(retries_left = try_count - 1, "fetch re-queued");
                if let Some(metrics) = &self.metrics {
                    metrics.job_enqueued(JobKind::Fetch);
                }
            }
            Err(e) => warn!(error = %e, "failed to re-queue fetch"),
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{RecordingQueue, ScriptedStasher, ToggleFilter};

    fn failing_stasher() -> Arc<ScriptedStasher> {
        Arc::new(ScriptedStasher::new(
            Duration::ZERO,
            Err(Error::Upstream("502".into())),
        ))
    }

    #[tokio::test]
    async fn budget_of_three_means_four_attempts() {
        let stasher = failing_stasher();
        let queue = Arc::new(RecordingQueue::new());
        let fetcher = CacheMissFetcher::new(
            stasher.clone(),
            queue.clone(),
            Arc::new(ToggleFilter::allow_all()),
        );

        let mut seen = Vec::new();
        let mut next = Some(Job::fetch("a/b", "v1", 3));
        while let Some(Job::FetchCacheMiss {
            module,
            version,
            try_count,
        }) = next.take()
        {
            assert!(fetcher.handle(&module, &version, try_count).await.is_err());
            let mut queued = queue.take();
            assert!(queued.len() <= 1);
            next = queued.pop();
            if let Some(Job::FetchCacheMiss { try_count, .. }) = &next {
                seen.push(*try_count);
            }
        }

        assert_eq!(stasher.started(), 4);
        assert_eq!(seen, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn success_is_not_requeued() {
        let stasher = Arc::new(ScriptedStasher::new(Duration::ZERO, Ok(())));
        let queue = Arc::new(RecordingQueue::new());
        let fetcher = CacheMissFetcher::new(
            stasher.clone(),
            queue.clone(),
            Arc::new(ToggleFilter::allow_all()),
        );

        fetcher.handle("a/b", "v1", 3).await.unwrap();

        assert_eq!(stasher.started(), 1);
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_counts_a_drop() {
        let registry = crate::metrics::MetricsRegistry::new();
        let queue = Arc::new(RecordingQueue::new());
        let fetcher = CacheMissFetcher::new(
            failing_stasher(),
            queue.clone(),
            Arc::new(ToggleFilter::allow_all()),
        )
        .with_metrics(registry.metrics.clone());

        assert!(fetcher.handle("a/b", "v1", 0).await.is_err());

        assert!(queue.jobs().is_empty());
        let text = registry.encode().unwrap();
        assert!(text.contains("modcache_jobs_dropped_total{job=\"Fetch\"} 1"));
    }

    #[tokio::test]
    async fn rejecting_queue_still_reports_stash_error() {
        let fetcher = CacheMissFetcher::new(
            failing_stasher(),
            Arc::new(RecordingQueue::rejecting()),
            Arc::new(ToggleFilter::allow_all()),
        );

        let err = fetcher.handle("a/b", "v1", 2).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Upstream);
    }

    /// Fails its stash after excluding the module mid-attempt.
    struct ExcludingStasher {
        filter: Arc<ToggleFilter>,
    }

    #[async_trait::async_trait]
    impl Stasher for ExcludingStasher {
        async fn stash(&self, _module: &str, _version: &str) -> Result<()> {
            self.filter.set(false);
            Err(Error::Upstream("502".into()))
        }
    }

    #[tokio::test]
    async fn module_excluded_during_attempt_is_not_requeued() {
        let filter = Arc::new(ToggleFilter::allow_all());
        let queue = Arc::new(RecordingQueue::new());
        let fetcher = CacheMissFetcher::new(
            Arc::new(ExcludingStasher {
                filter: filter.clone(),
            }),
            queue.clone(),
            filter.clone(),
        );

        let err = fetcher.handle("a/b", "v1", 3).await.unwrap_err();

        assert_eq!(err.kind(), crate::errors::ErrorKind::Upstream);
        assert!(queue.jobs().is_empty());
        assert!(!filter.should_process("a/b"));
    }
}
