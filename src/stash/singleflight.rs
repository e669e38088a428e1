//! In-process deduplication of concurrent stashes.
//!
//! The first caller for a key becomes the leader and runs the wrapped
//! stasher on its own task; everyone who arrives while that run is in flight
//! subscribes to it.  When the run ends, the leader removes the ticket and
//! delivers the result to every subscriber in one critical section, so a
//! late arrival either lands on the old ticket and is served, or finds no
//! ticket and starts a fresh run.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::errors::{Error, Op, Result};
use crate::metrics::Metrics;
use crate::module::fmt_mod_ver;

use super::Stasher;

const OP: Op = "singleflight.Stash";

/// In-flight bookkeeping for one key.  Presence in the map means a leader
/// is running.
#[derive(Default)]
struct Ticket {
    subscribers: Vec<oneshot::Sender<Result<()>>>,
}

type Tickets = Arc<Mutex<HashMap<String, Ticket>>>;

pub struct Singleflight {
    inner: Arc<dyn Stasher>,
    tickets: Tickets,
    metrics: Option<Arc<Metrics>>,
}

impl Singleflight {
    pub fn new(inner: Arc<dyn Stasher>) -> Self {
        Self {
            inner,
            tickets: Arc::new(Mutex::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of keys with a run in flight.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.tickets.lock().len()
    }

    fn lead(&self, key: String, module: &str, version: &str) {
        let inner = Arc::clone(&self.inner);
        let tickets = Arc::clone(&self.tickets);
        let module = module.to_string();
        let version = version.to_string();

        tokio::spawn(async move {
            // A nested task turns a panicking stasher into an error result
            // instead of stranding the ticket.
            let run = tokio::spawn(async move { inner.stash(&module, &version).await });
            let result = match run.await {
                Ok(result) => result,
                Err(e) => {
                    error!(%key, error = %e, "stash task aborted");
                    Err(Error::op(OP, Error::Internal(format!("stash task aborted: {e}"))))
                }
            };

            let mut tickets = tickets.lock();
            if let Some(ticket) = tickets.remove(&key) {
                debug!(%key, subscribers = ticket.subscribers.len(), "delivering stash result");
                for tx in ticket.subscribers {
                    // A subscriber that stopped waiting has dropped its receiver.
                    let _ = tx.send(result.clone());
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl Stasher for Singleflight {
    async fn stash(&self, module: &str, version: &str) -> Result<()> {
        let key = fmt_mod_ver(module, version);
        let (tx, rx) = oneshot::channel();

        let is_leader = {
            let mut tickets = self.tickets.lock();
            match tickets.entry(key.clone()) {
                Entry::Occupied(mut ticket) => {
                    ticket.get_mut().subscribers.push(tx);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(Ticket {
                        subscribers: vec![tx],
                    });
                    true
                }
            }
        };

        if is_leader {
            self.lead(key, module, version);
        } else {
            debug!(%key, "joining in-flight stash");
            if let Some(metrics) = &self.metrics {
                metrics.stash_coalesced.inc();
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(Error::op(
                OP,
                Error::Internal("stash leader exited without a result".into()),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::ScriptedStasher;

    async fn run_concurrently(sf: Arc<Singleflight>, n: usize, module: &str) -> Vec<Result<()>> {
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let sf = Arc::clone(&sf);
                let module = module.to_string();
                tokio::spawn(async move { sf.stash(&module, "v2").await })
            })
            .collect();
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let err = Error::Upstream("E".into());
        let inner = Arc::new(ScriptedStasher::new(
            Duration::from_millis(100),
            Err(err.clone()),
        ));
        let sf = Arc::new(Singleflight::new(inner.clone()));

        let results = run_concurrently(sf.clone(), 2, "a/b").await;

        assert_eq!(inner.started(), 1);
        for result in results {
            assert_eq!(result, Err(err.clone()));
        }
        assert_eq!(sf.in_flight(), 0);
    }

    #[tokio::test]
    async fn many_callers_one_execution() {
        let inner = Arc::new(ScriptedStasher::new(Duration::from_millis(50), Ok(())));
        let sf = Arc::new(Singleflight::new(inner.clone()));

        let results = run_concurrently(sf, 32, "example.com/foo").await;

        assert_eq!(inner.started(), 1);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn next_call_after_completion_runs_again() {
        let inner = Arc::new(ScriptedStasher::new(Duration::from_millis(1), Ok(())));
        let sf = Singleflight::new(inner.clone());

        sf.stash("a/b", "v1").await.unwrap();
        sf.stash("a/b", "v1").await.unwrap();

        assert_eq!(inner.started(), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let inner = Arc::new(ScriptedStasher::new(Duration::from_millis(20), Ok(())));
        let sf = Arc::new(Singleflight::new(inner.clone()));

        let a = tokio::spawn({
            let sf = Arc::clone(&sf);
            async move { sf.stash("a/b", "v1").await }
        });
        let b = tokio::spawn({
            let sf = Arc::clone(&sf);
            async move { sf.stash("a/b", "v2").await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(inner.started(), 2);
    }

    #[tokio::test]
    async fn keys_are_case_sensitive() {
        let inner = Arc::new(ScriptedStasher::new(Duration::from_millis(20), Ok(())));
        let sf = Arc::new(Singleflight::new(inner.clone()));

        let upper = tokio::spawn({
            let sf = Arc::clone(&sf);
            async move { sf.stash("github.com/Azure/go", "v1").await }
        });
        sf.stash("github.com/azure/go", "v1").await.unwrap();
        upper.await.unwrap().unwrap();

        assert_eq!(inner.started(), 2);
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_cancel_leader() {
        let inner = Arc::new(ScriptedStasher::new(Duration::from_millis(100), Ok(())));
        let sf = Arc::new(Singleflight::new(inner.clone()));

        let gave_up = tokio::time::timeout(Duration::from_millis(10), sf.stash("a/b", "v1")).await;
        assert!(gave_up.is_err());

        // A caller arriving mid-flight joins the same run.
        sf.stash("a/b", "v1").await.unwrap();
        assert_eq!(inner.started(), 1);
        assert_eq!(inner.finished(), 1);
    }
}
