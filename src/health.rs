use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::interfaces::ClientLike;
use serde::Serialize;

use crate::storage::Backend;

const UPSTREAM_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub storage: CheckResult,
    pub upstream: CheckResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keydb: Option<CheckResult>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Everything the health checks talk to.
#[derive(Clone)]
pub struct HealthState {
    pub storage: Arc<dyn Backend>,
    pub http_client: reqwest::Client,
    pub upstream_url: String,
    pub keydb: Option<fred::clients::Pool>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_storage(storage: &dyn Backend) -> CheckResult {
    // Any answer, present or absent, proves the backend is reachable.
    match storage.exists("modcache.health/probe", "v0.0.0").await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("storage probe failed: {e}")),
    }
}

async fn check_upstream(client: &reqwest::Client, url: &str, timeout: Duration) -> CheckResult {
    match client.head(url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_server_error() => {
            CheckResult::unhealthy(format!("HEAD {url} returned {}", resp.status()))
        }
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("HEAD {url} failed: {e}")),
    }
}

async fn check_keydb(pool: &fred::clients::Pool) -> CheckResult {
    match pool.ping::<String>(None).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Storage and KeyDB are required to serve and queue; a down upstream still
/// leaves every cached version servable.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let keydb_ok = checks.keydb.as_ref().map_or(true, |c| c.ok);

    if !checks.storage.ok || !keydb_ok {
        HealthStatus::Unhealthy
    } else if !checks.upstream.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(state: &HealthState) -> impl IntoResponse {
    let keydb = async {
        match &state.keydb {
            Some(pool) => Some(check_keydb(pool).await),
            None => None,
        }
    };
    let (storage, upstream, keydb) = tokio::join!(
        check_storage(state.storage.as_ref()),
        check_upstream(&state.http_client, &state.upstream_url, UPSTREAM_CHECK_TIMEOUT),
        keydb,
    );

    let checks = HealthChecks {
        storage,
        upstream,
        keydb,
    };
    let status = aggregate_status(&checks);
    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(HealthResponse { status, checks }))
}
