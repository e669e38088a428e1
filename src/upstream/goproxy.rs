//! HTTP client for a GOPROXY-compatible origin.

use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::StatusCode;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};

use crate::errors::{Error, Op, Result};
use crate::module::{escape_path, RevInfo, VersionBundle, ZipArchive};

use super::Protocol;

/// Upstream module proxy reached over HTTP.
#[derive(Debug, Clone)]
pub struct GoProxy {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl GoProxy {
    pub fn new(client: reqwest::Client, base_url: &str, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn version_url(&self, module: &str, version: &str, ext: &str) -> String {
        format!(
            "{}/{}/@v/{}.{ext}",
            self.base_url,
            escape_path(module),
            escape_path(version)
        )
    }

    fn list_url(&self, module: &str) -> String {
        format!("{}/{}/@v/list", self.base_url, escape_path(module))
    }

    fn latest_url(&self, module: &str) -> String {
        format!("{}/{}/@latest", self.base_url, escape_path(module))
    }

    async fn send(&self, op: Op, url: &str, what: &str) -> Result<reqwest::Response> {
        debug!(%url, "upstream GET");
        let resp = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::op(op, e.into()))?;

        if let Some(err) = classify_status(resp.status(), what) {
            return Err(Error::op(op, err));
        }
        Ok(resp)
    }

    async fn get(&self, op: Op, url: &str, what: &str) -> Result<Bytes> {
        let resp = self.send(op, url, what).await?;
        resp.bytes().await.map_err(|e| Error::op(op, e.into()))
    }
}

/// Map a non-success upstream status to an error.
fn classify_status(status: StatusCode, what: &str) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Error::NotFound(what.to_string()),
        _ => Error::Upstream(format!("{what}: upstream returned {status}")),
    })
}

#[async_trait::async_trait]
impl Protocol for GoProxy {
    #[instrument(skip(self))]
    async fn list(&self, module: &str) -> Result<Vec<String>> {
        let body = self.get("goproxy.List", &self.list_url(module), module).await?;
        let text = String::from_utf8_lossy(&body);
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    #[instrument(skip(self))]
    async fn info(&self, module: &str, version: &str) -> Result<Bytes> {
        let what = format!("{module}@{version}");
        self.get("goproxy.Info", &self.version_url(module, version, "info"), &what)
            .await
    }

    #[instrument(skip(self))]
    async fn latest(&self, module: &str) -> Result<RevInfo> {
        const OP: Op = "goproxy.Latest";
        let body = self.get(OP, &self.latest_url(module), module).await?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::op(OP, Error::Upstream(format!("decode @latest: {e}"))))
    }

    #[instrument(skip(self))]
    async fn go_mod(&self, module: &str, version: &str) -> Result<Bytes> {
        let what = format!("{module}@{version}");
        self.get("goproxy.GoMod", &self.version_url(module, version, "mod"), &what)
            .await
    }

    #[instrument(skip(self))]
    async fn zip(&self, module: &str, version: &str) -> Result<ZipArchive> {
        let what = format!("{module}@{version}");
        let resp = self
            .send("goproxy.Zip", &self.version_url(module, version, "zip"), &what)
            .await?;
        let size = resp.content_length();
        let body = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(ZipArchive::new(
            Box::new(StreamReader::new(Box::pin(body))),
            size,
        ))
    }

    #[instrument(skip(self))]
    async fn version(&self, module: &str, version: &str) -> Result<VersionBundle> {
        const OP: Op = "goproxy.Version";
        let (info, go_mod, zip) = tokio::try_join!(
            self.info(module, version),
            self.go_mod(module, version),
            self.zip(module, version),
        )
        .map_err(|e| Error::op(OP, e))?;
        Ok(VersionBundle { info, go_mod, zip })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> GoProxy {
        GoProxy::new(
            reqwest::Client::new(),
            "https://proxy.golang.org/",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn urls_escape_upper_case() {
        let p = proxy();
        assert_eq!(
            p.version_url("github.com/Azure/go-autorest", "v1.0.0", "zip"),
            "https://proxy.golang.org/github.com/!azure/go-autorest/@v/v1.0.0.zip"
        );
        assert_eq!(
            p.list_url("github.com/BurntSushi/toml"),
            "https://proxy.golang.org/github.com/!burnt!sushi/toml/@v/list"
        );
        assert_eq!(
            p.latest_url("golang.org/x/text"),
            "https://proxy.golang.org/golang.org/x/text/@latest"
        );
    }

    #[test]
    fn missing_and_gone_are_not_found() {
        let err = classify_status(StatusCode::NOT_FOUND, "a/b@v1").unwrap();
        assert!(err.is_not_found());
        let err = classify_status(StatusCode::GONE, "a/b@v1").unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn server_errors_are_upstream_failures() {
        let err = classify_status(StatusCode::BAD_GATEWAY, "a/b@v1").unwrap();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Upstream);
        assert!(classify_status(StatusCode::OK, "a/b@v1").is_none());
    }

    #[tokio::test]
    async fn zip_is_streamed_with_its_length() {
        let app = axum::Router::new().route(
            "/github.com/!acme/tool/@v/v1.0.0.zip",
            axum::routing::get(|| async { vec![7u8; 64 * 1024] }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let proxy = GoProxy::new(reqwest::Client::new(), &base, Duration::from_secs(5));
        let zip = proxy.zip("github.com/Acme/tool", "v1.0.0").await.unwrap();
        assert_eq!(zip.size(), Some(64 * 1024));
        let body = zip.read_all().await.unwrap();
        assert_eq!(body.len(), 64 * 1024);
        assert!(body.iter().all(|b| *b == 7));

        let err = proxy.zip("github.com/Acme/tool", "v9.9.9").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
