//! KeyDB / Redis client pool creation.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::KeyDbConfig;

const POOL_SIZE: usize = 4;

/// Create and connect a KeyDB pool for the shared job queue and stash locks.
///
/// The auth token is read from the environment variable named by
/// `config.auth_token_env`; a missing variable means no AUTH.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(POOL_SIZE)
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(host, port, tls = config.tls, pool_size = POOL_SIZE, "KeyDB pool ready");
    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    match endpoint.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, 6379)),
    }
}
