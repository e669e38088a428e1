use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument};
use url::Url;

use crate::errors::{Error, Op, Result};
use crate::filter::FilterPolicy;
use crate::metrics::{JobKind, Metrics};

use super::{Job, WorkQueue};

const OP: Op = "jobs.ReportCacheMiss";

#[derive(Debug, Serialize)]
struct CacheMissPayload<'a> {
    module: &'a str,
    version: &'a str,
}

/// Resolve the tracking service's cache-miss URL under `endpoint`, keeping
/// any path the endpoint already carries.
pub fn cache_miss_url(endpoint: &str) -> Result<Url> {
    let mut base = Url::parse(endpoint)
        .map_err(|e| Error::Internal(format!("invalid tracking endpoint {endpoint:?}: {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("cachemiss")
        .map_err(|e| Error::Internal(format!("invalid tracking endpoint {endpoint:?}: {e}")))
}

/// Tells the tracking service about a miss, then queues the fetch that
/// repairs it.
pub struct CacheMissReporter {
    filter: Arc<dyn FilterPolicy>,
    queue: Arc<dyn WorkQueue>,
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
    max_try_count: u32,
    metrics: Option<Arc<Metrics>>,
}

impl CacheMissReporter {
    pub fn new(
        filter: Arc<dyn FilterPolicy>,
        queue: Arc<dyn WorkQueue>,
        client: reqwest::Client,
        endpoint: &str,
        timeout: Duration,
        max_try_count: u32,
    ) -> Result<Self> {
        Ok(Self {
            filter,
            queue,
            client,
            url: cache_miss_url(endpoint)?,
            timeout,
            max_try_count,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self))]
    pub async fn handle(&self, module: &str, version: &str) -> Result<()> {
        // The policy may have changed since the report was queued.
        if !self.filter.should_process(module) {
            return Err(Error::op(OP, Error::Excluded(module.to_string())));
        }

        self.client
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&CacheMissPayload { module, version })
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| Error::op(OP, e.into()))?;
        info!(url = %self.url, "cache miss reported");

        self.queue
            .enqueue(Job::fetch(module, version, self.max_try_count))
            .await
            .map_err(|e| Error::op(OP, e))?;
        if let Some(metrics) = &self.metrics {
            metrics.job_enqueued(JobKind::Fetch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use super::*;
    use crate::errors::ErrorKind;
    use crate::test_support::{RecordingQueue, ToggleFilter};

    #[derive(Clone)]
    struct Tracker {
        status: StatusCode,
        received: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn record(
        State(tracker): State<Tracker>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        tracker.received.lock().push(body);
        tracker.status
    }

    /// Serve a fake tracking service and return its base URL.
    async fn spawn_tracker(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/api/cachemiss", post(record))
            .with_state(Tracker {
                status,
                received: received.clone(),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/api"), received)
    }

    fn reporter(endpoint: &str, queue: Arc<RecordingQueue>) -> CacheMissReporter {
        CacheMissReporter::new(
            Arc::new(ToggleFilter::allow_all()),
            queue,
            reqwest::Client::new(),
            endpoint,
            Duration::from_secs(5),
            3,
        )
        .unwrap()
    }

    #[test]
    fn url_keeps_endpoint_path() {
        assert_eq!(
            cache_miss_url("http://tracker:8080").unwrap().as_str(),
            "http://tracker:8080/cachemiss"
        );
        assert_eq!(
            cache_miss_url("http://tracker:8080/api/v1").unwrap().as_str(),
            "http://tracker:8080/api/v1/cachemiss"
        );
        assert_eq!(
            cache_miss_url("http://tracker:8080/api/").unwrap().as_str(),
            "http://tracker:8080/api/cachemiss"
        );
        assert!(cache_miss_url("not a url").is_err());
    }

    #[tokio::test]
    async fn success_posts_payload_and_queues_fetch() {
        let (endpoint, received) = spawn_tracker(StatusCode::OK).await;
        let queue = Arc::new(RecordingQueue::new());

        reporter(&endpoint, queue.clone())
            .handle("example.com/foo", "v1.0.0")
            .await
            .unwrap();

        assert_eq!(
            received.lock().clone(),
            vec![serde_json::json!({"module": "example.com/foo", "version": "v1.0.0"})]
        );
        assert_eq!(queue.jobs(), vec![Job::fetch("example.com/foo", "v1.0.0", 3)]);
    }

    #[tokio::test]
    async fn error_status_is_a_failure_and_queues_nothing() {
        let (endpoint, received) = spawn_tracker(StatusCode::INTERNAL_SERVER_ERROR).await;
        let queue = Arc::new(RecordingQueue::new());

        let err = reporter(&endpoint, queue.clone())
            .handle("example.com/foo", "v1.0.0")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(received.lock().len(), 1);
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn unreachable_tracker_is_a_failure() {
        let queue = Arc::new(RecordingQueue::new());
        let result = reporter("http://127.0.0.1:9", queue.clone())
            .handle("example.com/foo", "v1.0.0")
            .await;

        assert!(result.is_err());
        assert!(queue.jobs().is_empty());
    }
}
