//! Background repair of cache misses.
//!
//! A NotFound answer to a client is caught by the [`MissInterceptor`], which
//! queues a report job.  The [`CacheMissReporter`] tells the central tracking
//! service about the miss and queues a fetch job; the [`CacheMissFetcher`]
//! stashes the version, re-queueing itself with one less try until the
//! budget runs out.  Delivery is at-least-once, so every handler tolerates
//! running twice for the same version.

pub mod fetcher;
pub mod interceptor;
pub mod queue;
pub mod reporter;
pub mod worker;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::metrics::JobKind;
use crate::module::ModuleVersion;

pub use fetcher::CacheMissFetcher;
pub use interceptor::MissInterceptor;
pub use queue::{KeyDbQueue, MemoryQueue};
pub use reporter::CacheMissReporter;
pub use worker::{run_workers, JobRunner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Job {
    ReportCacheMiss {
        module: String,
        version: String,
    },
    FetchCacheMiss {
        module: String,
        version: String,
        /// Retries left after this attempt.
        try_count: u32,
    },
}

impl Job {
    pub fn report(mv: &ModuleVersion) -> Self {
        Job::ReportCacheMiss {
            module: mv.module.clone(),
            version: mv.version.clone(),
        }
    }

    pub fn fetch(module: &str, version: &str, try_count: u32) -> Self {
        Job::FetchCacheMiss {
            module: module.to_string(),
            version: version.to_string(),
            try_count,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::ReportCacheMiss { .. } => JobKind::Report,
            Job::FetchCacheMiss { .. } => JobKind::Fetch,
        }
    }

    pub fn module(&self) -> &str {
        match self {
            Job::ReportCacheMiss { module, .. } | Job::FetchCacheMiss { module, .. } => module,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Job::ReportCacheMiss { version, .. } | Job::FetchCacheMiss { version, .. } => version,
        }
    }
}

/// A job handed to a worker, held by the queue until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: Job,
    /// Raw queued payload, for queues that track in-flight jobs.
    receipt: Option<String>,
}

impl Delivery {
    pub fn new(job: Job) -> Self {
        Self { job, receipt: None }
    }

    fn with_receipt(job: Job, receipt: String) -> Self {
        Self {
            job,
            receipt: Some(receipt),
        }
    }
}

/// External work queue with at-least-once delivery.
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Next job.  Waits up to the queue's idle interval and returns `None`
    /// if nothing arrived, so callers can check for shutdown between polls.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Mark a delivery as finished.  Until then a durable queue may hand it
    /// out again after a crash.
    async fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }

    /// Re-queue deliveries this consumer took but never acknowledged in a
    /// previous run.  Returns how many were re-queued.
    async fn recover(&self) -> Result<usize> {
        Ok(0)
    }
}
