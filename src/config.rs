use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::filter::Rule;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub stash: StashConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    /// When present, jobs go through a shared KeyDB list and stashes take a
    /// fleet-wide lock.  Otherwise both stay in-process.
    #[serde(default)]
    pub keydb: Option<KeyDbConfig>,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:3000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

fn default_http_listen() -> String {
    "0.0.0.0:3000".to_string()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream module proxy (e.g. `https://proxy.golang.org`).
    pub url: String,
    /// Per-request timeout (seconds) for upstream HTTP calls.
    #[serde(default = "default_upstream_timeout")]
    pub request_timeout: u64,
}

fn default_upstream_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Memory,
    Disk,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    #[serde(default)]
    pub disk: Option<DiskStorageConfig>,
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskStorageConfig {
    /// Root directory for cached module artifacts.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default = "default_s3_prefix")]
    pub prefix: String,
    pub region: String,
    /// Use the FIPS endpoints for S3 operations.
    #[serde(default)]
    pub use_fips: bool,
}

fn default_s3_prefix() -> String {
    "modcache/".to_string()
}

// ---------------------------------------------------------------------------
// Stash
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StashConfig {
    /// Hard deadline (seconds) for one upstream fetch-and-save.
    #[serde(default = "default_stash_timeout")]
    pub timeout: u64,
    /// TTL (seconds) of the fleet-wide stash lock in KeyDB.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: u64,
    /// How long (seconds) a node waits for another node's stash lock.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            timeout: default_stash_timeout(),
            lock_ttl: default_lock_ttl(),
            lock_wait_timeout: default_lock_wait_timeout(),
        }
    }
}

impl StashConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

fn default_stash_timeout() -> u64 {
    600
}

fn default_lock_ttl() -> u64 {
    900
}

fn default_lock_wait_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Background jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Queue name (the KeyDB list key when KeyDB is configured).
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Retry budget handed to every new fetch job.
    #[serde(default = "default_max_try_count")]
    pub max_try_count: u32,
    /// Number of concurrent job workers in this process.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Poll interval (milliseconds) for an empty KeyDB queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            max_try_count: default_max_try_count(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_queue() -> String {
    "modcache:jobs".to_string()
}

fn default_max_try_count() -> u32 {
    3
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Cache-miss tracking endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Base URL of the central tracking service; misses are posted to
    /// `{endpoint}/cachemiss`.
    pub endpoint: String,
    /// Timeout (seconds) for one miss notification.
    #[serde(default = "default_tracking_timeout")]
    pub timeout: u64,
}

fn default_tracking_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Module filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Rule applied to modules that match no prefix.
    #[serde(default = "default_filter_rule")]
    pub default: Rule,
    /// Rule lines of the form `+ prefix` (include) or `- prefix` (exclude).
    #[serde(default)]
    pub rules: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            default: default_filter_rule(),
            rules: Vec::new(),
        }
    }
}

fn default_filter_rule() -> Rule {
    Rule::Include
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse config")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    match config.storage.kind {
        StorageKind::Disk => anyhow::ensure!(
            config.storage.disk.is_some(),
            "storage.disk is required when storage.kind is disk"
        ),
        StorageKind::S3 => anyhow::ensure!(
            config.storage.s3.is_some(),
            "storage.s3 is required when storage.kind is s3"
        ),
        StorageKind::Memory => {}
    }
    anyhow::ensure!(config.jobs.workers > 0, "jobs.workers must be at least 1");
    anyhow::ensure!(config.stash.timeout > 0, "stash.timeout must be positive");
    anyhow::ensure!(config.stash.lock_ttl > 0, "stash.lock_ttl must be positive");
    anyhow::ensure!(
        config.stash.lock_ttl > config.stash.timeout,
        "stash.lock_ttl ({}s) must exceed stash.timeout ({}s) so the lock outlives a fetch",
        config.stash.lock_ttl,
        config.stash.timeout
    );
    url::Url::parse(&config.upstream.url).context("upstream.url is not a valid URL")?;
    url::Url::parse(&config.tracking.endpoint).context("tracking.endpoint is not a valid URL")?;
    for line in &config.filter.rules {
        crate::filter::parse_rule_line(line)
            .with_context(|| format!("invalid filter rule: {line:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
proxy: {}
upstream:
  url: https://proxy.golang.org
storage:
  kind: memory
tracking:
  endpoint: http://olympus.local
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.proxy.http_listen, "0.0.0.0:3000");
        assert_eq!(config.stash.timeout, 600);
        assert_eq!(config.jobs.max_try_count, 3);
        assert_eq!(config.jobs.queue, "modcache:jobs");
        assert_eq!(config.tracking.timeout, 30);
        assert_eq!(config.filter.default, Rule::Include);
        assert!(config.keydb.is_none());
    }

    #[test]
    fn disk_kind_requires_disk_section() {
        let yaml = MINIMAL.replace("kind: memory", "kind: disk");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn rejects_bad_filter_rule() {
        let yaml = format!("{MINIMAL}filter:\n  rules: [\"? github.com/foo\"]\n");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn lock_ttl_must_outlive_the_stash_deadline() {
        let yaml = format!("{MINIMAL}stash:\n  timeout: 600\n  lock_ttl: 300\n");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("stash.lock_ttl"));

        let yaml = format!("{MINIMAL}stash:\n  timeout: 600\n  lock_ttl: 600\n");
        assert!(parse_config(&yaml).is_err());

        let yaml = format!("{MINIMAL}stash:\n  timeout: 60\n  lock_ttl: 0\n");
        assert!(parse_config(&yaml).is_err());

        let yaml = format!("{MINIMAL}stash:\n  timeout: 60\n  lock_ttl: 90\n");
        assert!(parse_config(&yaml).is_ok());
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
proxy:
  http_listen: 127.0.0.1:8080
upstream:
  url: https://proxy.golang.org
  request_timeout: 60
storage:
  kind: disk
  disk:
    path: /var/cache/modcache
stash:
  timeout: 120
jobs:
  queue: misses
  max_try_count: 5
  workers: 2
tracking:
  endpoint: http://olympus.local/api
  timeout: 10
filter:
  default: exclude
  rules:
    - "+ github.com/acme"
    - "- github.com/acme/secret"
keydb:
  endpoint: redis://keydb.local:6379
  tls: false
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.storage.kind, StorageKind::Disk);
        assert_eq!(config.stash.timeout(), Duration::from_secs(120));
        assert_eq!(config.jobs.max_try_count, 5);
        assert_eq!(config.filter.default, Rule::Exclude);
        assert_eq!(config.filter.rules.len(), 2);
        assert!(!config.keydb.unwrap().tls);
    }
}
