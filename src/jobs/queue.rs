//! [`WorkQueue`] implementations: an in-process channel for single-node
//! deployments and a KeyDB list shared by the fleet.

use std::sync::Arc;
use std::time::Duration;

use fred::interfaces::ListInterface;
use fred::types::lists::LMoveDirection;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::errors::{Error, Op, Result};

use super::{Delivery, Job, WorkQueue};

const ENQUEUE_OP: Op = "queue.Enqueue";
const DEQUEUE_OP: Op = "queue.Dequeue";
const ACK_OP: Op = "queue.Ack";
const RECOVER_OP: Op = "queue.Recover";

const MEMORY_IDLE_WAIT: Duration = Duration::from_millis(250);

/// Unbounded in-process queue.  Jobs do not survive a restart.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<mpsc::UnboundedReceiver<Job>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| Error::op(ENQUEUE_OP, Error::Internal("queue closed".into())))
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        let next = tokio::time::timeout(MEMORY_IDLE_WAIT, async {
            self.rx.lock().await.recv().await
        })
        .await;
        Ok(next.ok().flatten().map(Delivery::new))
    }
}

// ---------------------------------------------------------------------------
// KeyDB
// ---------------------------------------------------------------------------

/// List primitives the shared queue is built from.
#[async_trait::async_trait]
pub trait JobList: Send + Sync {
    /// Append `payload` to the tail of `list`.
    async fn push(&self, list: &str, payload: String) -> Result<()>;

    /// Atomically move the head of `from` onto the head of `to`.
    async fn move_head(&self, from: &str, to: &str) -> Result<Option<String>>;

    /// Remove one occurrence of `payload` from `list`.
    async fn remove(&self, list: &str, payload: &str) -> Result<()>;
}

fn keydb_err(err: fred::error::Error) -> Error {
    Error::Internal(format!("keydb: {err}"))
}

#[async_trait::async_trait]
impl JobList for fred::clients::Pool {
    async fn push(&self, list: &str, payload: String) -> Result<()> {
        let _: i64 = self.rpush(list, payload).await.map_err(keydb_err)?;
        Ok(())
    }

    async fn move_head(&self, from: &str, to: &str) -> Result<Option<String>> {
        self.lmove(from, to, LMoveDirection::Left, LMoveDirection::Left)
            .await
            .map_err(keydb_err)
    }

    async fn remove(&self, list: &str, payload: &str) -> Result<()> {
        let _: i64 = self.lrem(list, 1, payload).await.map_err(keydb_err)?;
        Ok(())
    }
}

/// Queue backed by a KeyDB list.
///
/// Jobs are RPUSHed onto `key`.  A dequeue LMOVEs the head into this
/// consumer's processing list `{key}:processing:{consumer}`, where it stays
/// until acknowledged.  Whatever a crashed run left there is pushed back onto
/// the queue by [`WorkQueue::recover`] at the next start.
pub struct KeyDbQueue {
    lists: Arc<dyn JobList>,
    key: String,
    processing: String,
    poll_interval: Duration,
}

impl KeyDbQueue {
    pub fn new(
        lists: Arc<dyn JobList>,
        key: impl Into<String>,
        consumer: &str,
        poll_interval: Duration,
    ) -> Self {
        let key = key.into();
        Self {
            processing: format!("{key}:processing:{consumer}"),
            lists,
            key,
            poll_interval,
        }
    }
}

#[async_trait::async_trait]
impl WorkQueue for KeyDbQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let payload = serde_json::to_string(&job).map_err(|e| Error::op(ENQUEUE_OP, e.into()))?;
        self.lists
            .push(&self.key, payload)
            .await
            .map_err(|e| Error::op(ENQUEUE_OP, e))?;
        debug!(queue = %self.key, module = job.module(), version = job.version(), "job pushed");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        loop {
            let moved = self
                .lists
                .move_head(&self.key, &self.processing)
                .await
                .map_err(|e| Error::op(DEQUEUE_OP, e))?;

            let Some(payload) = moved else {
                tokio::time::sleep(self.poll_interval).await;
                return Ok(None);
            };
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => return Ok(Some(Delivery::with_receipt(job, payload))),
                Err(e) => {
                    warn!(queue = %self.key, error = %e, %payload, "discarding malformed job");
                    self.lists
                        .remove(&self.processing, &payload)
                        .await
                        .map_err(|e| Error::op(DEQUEUE_OP, e))?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let Some(receipt) = &delivery.receipt else {
            return Ok(());
        };
        self.lists
            .remove(&self.processing, receipt)
            .await
            .map_err(|e| Error::op(ACK_OP, e))
    }

    async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        while self
            .lists
            .move_head(&self.processing, &self.key)
            .await
            .map_err(|e| Error::op(RECOVER_OP, e))?
            .is_some()
        {
            recovered += 1;
        }
        if recovered > 0 {
            info!(queue = %self.key, processing = %self.processing, recovered, "re-queued unacknowledged jobs");
        }
        Ok(recovered)
    }
}
