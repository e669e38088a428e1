use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::filter::FilterPolicy;
use crate::metrics::{JobKind, Metrics};
use crate::module::ModuleVersion;

use super::{Job, WorkQueue};

/// Wraps a request handler and queues a background report when it ends in
/// NotFound.  The handler's result is always returned untouched; queueing
/// problems are logged and go no further.
pub struct MissInterceptor {
    filter: Arc<dyn FilterPolicy>,
    queue: Arc<dyn WorkQueue>,
    metrics: Option<Arc<Metrics>>,
}

impl MissInterceptor {
    pub fn new(filter: Arc<dyn FilterPolicy>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            filter,
            queue,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn intercept<T, Fut>(&self, mv: &ModuleVersion, handler: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let result = handler.await;
        if let Err(err) = &result {
            if err.is_not_found() {
                self.report(mv).await;
            }
        }
        result
    }

    async fn report(&self, mv: &ModuleVersion) {
        if !self.filter.should_process(&mv.module) {
            info!(module = %mv.module, version = %mv.version, "skipping cache-miss report for excluded module");
            return;
        }

        match self.queue.enqueue(Job::report(mv)).await {
            Ok(()) => {
                debug!(module = %mv.module, version = %mv.version, "cache-miss report queued");
                if let Some(metrics) = &self.metrics {
                    metrics.job_enqueued(JobKind::Report);
                }
            }
            Err(e) => {
                warn!(module = %mv.module, version = %mv.version, error = %e, "failed to queue cache-miss report");
            }
        }
    }
}
