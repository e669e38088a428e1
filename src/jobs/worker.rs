use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::errors::ErrorKind;
use crate::metrics::Metrics;

use super::{CacheMissFetcher, CacheMissReporter, Job, WorkQueue};

const DEQUEUE_BACKOFF: Duration = Duration::from_secs(1);

/// Dispatches dequeued jobs to their handlers.
pub struct JobRunner {
    reporter: CacheMissReporter,
    fetcher: CacheMissFetcher,
    metrics: Option<Arc<Metrics>>,
}

impl JobRunner {
    pub fn new(reporter: CacheMissReporter, fetcher: CacheMissFetcher) -> Self {
        Self {
            reporter,
            fetcher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute one job.  Failures are logged here and go no further.
    pub async fn run(&self, job: &Job) {
        let kind = job.kind();
        let result = match job {
            Job::ReportCacheMiss { module, version } => self.reporter.handle(module, version).await,
            Job::FetchCacheMiss {
                module,
                version,
                try_count,
            } => self.fetcher.handle(module, version, *try_count).await,
        };

        let Err(err) = result else {
            return;
        };
        if err.kind() == ErrorKind::Excluded {
            info!(module = job.module(), version = job.version(), "job skipped: {err}");
            return;
        }
        warn!(module = job.module(), version = job.version(), job = ?kind, error = %err, "job failed");
        if let Some(metrics) = &self.metrics {
            metrics.job_failed(kind);
        }
    }
}

/// Resolves once `true` is sent on the shutdown channel or its sender is
/// dropped.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    let stop = *shutdown.borrow();
    stop || shutdown.has_changed().is_err()
}

/// Spawn `workers` tasks that pull jobs from `queue` until shutdown is
/// signalled.
///
/// Shutdown is checked between polls, never while a dequeue is in flight,
/// so a job the queue has handed out is always run and acknowledged.
pub fn run_workers(
    queue: Arc<dyn WorkQueue>,
    runner: Arc<JobRunner>,
    workers: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&runner);
            let mut shutdown = shutdown.clone();
            tokio::spawn(
                async move {
                    debug!("job worker started");
                    while !stop_requested(&shutdown) {
                        match queue.dequeue().await {
                            Ok(Some(delivery)) => {
                                runner.run(&delivery.job).await;
                                if let Err(e) = queue.ack(&delivery).await {
                                    warn!(error = %e, "failed to acknowledge job, it will run again");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                error!(error = %e, "failed to dequeue job");
                                tokio::select! {
                                    _ = stopped(&mut shutdown) => break,
                                    _ = tokio::time::sleep(DEQUEUE_BACKOFF) => {}
                                }
                            }
                        }
                    }
                    debug!("job worker stopped");
                }
                .instrument(tracing::info_span!("job_worker", worker)),
            )
        })
        .collect()
}
