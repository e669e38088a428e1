//! Main axum router and HTTP request handlers for the module proxy.
//!
//! Routes:
//! - `GET /`                               - Landing text
//! - `GET /healthz`                        - Health check
//! - `GET /metrics`                        - Prometheus metrics
//! - `GET /{module}/@v/list`               - Known versions (upstream)
//! - `GET /{module}/@latest`               - Latest version (upstream)
//! - `GET /{module}/@v/{version}.info`     - Version metadata (cache-first)
//! - `GET /{module}/@v/{version}.mod`      - go.mod (cache-first)
//! - `GET /{module}/@v/{version}.zip`      - Source archive (cache-first)
//! - `POST /admin/upload/{module}/{version}` - Seed storage directly

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument};

use crate::errors::Error;
use crate::module::ZipArchive;
use crate::AppState;

use super::paths::{parse_request, parse_upload, ModRequest};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_home))
        .route("/admin/upload/{*target}", post(handle_upload))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_module)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Every module proxy endpoint.  `.info`, `.mod` and `.zip` misses are
/// handed to the miss interceptor; `list` and `@latest` are not.
#[instrument(skip(state, uri), fields(path = %uri.path()))]
async fn handle_module(State(state): State<Arc<AppState>>, uri: Uri) -> Result<Response, AppError> {
    let Some(request) = parse_request(uri.path()) else {
        debug!("not a module proxy path");
        return Ok((StatusCode::NOT_FOUND, "not found").into_response());
    };
    let proto = &state.protocol;

    let response = match request {
        ModRequest::List { module } => {
            let versions = proto.list(&module).await?;
            text_response(versions.join("\n"))
        }
        ModRequest::Latest { module } => Json(proto.latest(&module).await?).into_response(),
        ModRequest::Info(mv) => {
            let info = state
                .interceptor
                .intercept(&mv, proto.info(&mv.module, &mv.version))
                .await?;
            ([(header::CONTENT_TYPE, "application/json")], info).into_response()
        }
        ModRequest::Mod(mv) => {
            let go_mod = state
                .interceptor
                .intercept(&mv, proto.go_mod(&mv.module, &mv.version))
                .await?;
            text_response(go_mod)
        }
        ModRequest::Zip(mv) => {
            let zip = state
                .interceptor
                .intercept(&mv, proto.zip(&mv.module, &mv.version))
                .await?;
            let size = zip.size();
            let body = Body::from_stream(ReaderStream::new(zip.into_reader()));
            let mut response = ([(header::CONTENT_TYPE, "application/zip")], body).into_response();
            if let Some(size) = size {
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, header::HeaderValue::from(size));
            }
            response
        }
    };
    Ok(response)
}

/// `GET /`
async fn handle_home() -> Response {
    text_response(concat!("modcache ", env!("CARGO_PKG_VERSION"), ": Go module proxy\n"))
}

/// Upload body.  Every field is base64 of the raw artifact.
#[derive(Debug, Deserialize)]
struct UploadPayload {
    /// go.mod contents.
    module: String,
    zip: String,
    info: String,
}

fn decode_field(name: &str, value: &str) -> Result<Bytes, String> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map(Bytes::from)
        .map_err(|e| format!("field {name} is not valid base64: {e}"))
}

/// `POST /admin/upload/{module}/{version}`
///
/// Writes a version straight into storage, bypassing upstream.
#[instrument(skip(state, payload))]
async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
    Json(payload): Json<UploadPayload>,
) -> Result<Response, AppError> {
    let Some(mv) = parse_upload(&target) else {
        return Ok((StatusCode::BAD_REQUEST, "invalid module or version").into_response());
    };
    let decoded = decode_field("module", &payload.module).and_then(|go_mod| {
        Ok((
            go_mod,
            decode_field("zip", &payload.zip)?,
            decode_field("info", &payload.info)?,
        ))
    });
    let (go_mod, zip, info) = match decoded {
        Ok(parts) => parts,
        Err(msg) => return Ok((StatusCode::BAD_REQUEST, msg).into_response()),
    };

    let zip_bytes = zip.len();
    state
        .storage
        .save(&mv.module, &mv.version, go_mod, ZipArchive::from_bytes(zip), info)
        .await?;
    info!(module = %mv.module, version = %mv.version, zip_bytes, "version uploaded");
    Ok(StatusCode::OK.into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(&state.health).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| Error::Internal(format!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

fn text_response(body: impl Into<Body>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body.into(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Maps domain errors onto HTTP responses: NotFound is a 404, anything else
/// a 500.
#[derive(Debug)]
pub struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.0.is_not_found() {
            debug!(error = %self.0, "not found");
            return (StatusCode::NOT_FOUND, self.0.to_string()).into_response();
        }
        error!(error = %self.0, ops = ?self.0.ops(), "internal server error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}
