mod config;
mod coordination;
mod download;
mod errors;
mod filter;
mod health;
mod http;
mod jobs;
mod metrics;
mod module;
mod stash;
mod storage;
mod upstream;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fred::clients::Pool;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, StorageKind};
use crate::download::CacheFirst;
use crate::filter::{FilterPolicy, ModFilter};
use crate::health::HealthState;
use crate::jobs::{
    CacheMissFetcher, CacheMissReporter, JobRunner, KeyDbQueue, MemoryQueue, MissInterceptor,
    WorkQueue,
};
use crate::metrics::MetricsRegistry;
use crate::stash::{FetchStasher, LockedStasher, Singleflight, Stasher};
use crate::storage::{Backend, DiskStorage, MemoryStorage, S3Storage};
use crate::upstream::{GoProxy, Protocol};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "modcache", about = "Lazy replication cache for Go modules")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/modcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared across all request handlers.
pub struct AppState {
    /// Cache-first view of the module proxy protocol.
    pub protocol: Arc<dyn Protocol>,
    pub interceptor: Arc<MissInterceptor>,
    /// Target of operator uploads.
    pub storage: Arc<dyn Backend>,
    pub metrics: MetricsRegistry,
    pub health: HealthState,
}

// ---------------------------------------------------------------------------
// Storage setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &crate::config::S3StorageConfig) -> aws_sdk_s3::Client {
    let mut aws_config_loader =
        aws_config::from_env().region(aws_config::Region::new(config.region.clone()));

    if config.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    tracing::info!(
        bucket = %config.bucket,
        region = %config.region,
        fips = config.use_fips,
        "S3 client initialised"
    );
    aws_sdk_s3::Client::from_conf(s3_config)
}

async fn build_storage(config: &Config) -> Result<Arc<dyn Backend>> {
    let storage: Arc<dyn Backend> = match config.storage.kind {
        StorageKind::Memory => {
            tracing::warn!("using in-memory storage; the cache will not survive a restart");
            Arc::new(MemoryStorage::new())
        }
        StorageKind::Disk => {
            let disk = config
                .storage
                .disk
                .as_ref()
                .context("storage.disk is required when storage.kind is disk")?;
            tokio::fs::create_dir_all(&disk.path)
                .await
                .with_context(|| format!("failed to create storage dir: {}", disk.path))?;
            tracing::info!(path = %disk.path, "disk storage initialised");
            Arc::new(DiskStorage::new(&disk.path))
        }
        StorageKind::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .context("storage.s3 is required when storage.kind is s3")?;
            let client = build_s3_client(s3).await;
            Arc::new(S3Storage::new(client, s3.bucket.clone(), s3.prefix.clone()))
        }
    };
    Ok(storage)
}

// ---------------------------------------------------------------------------
// Stash / queue wiring
// ---------------------------------------------------------------------------

fn build_stasher(
    config: &Config,
    upstream: Arc<dyn Protocol>,
    storage: Arc<dyn Backend>,
    keydb: Option<&Pool>,
    metrics: &MetricsRegistry,
) -> Arc<dyn Stasher> {
    let fetch: Arc<dyn Stasher> = Arc::new(
        FetchStasher::new(upstream, Arc::clone(&storage), config.stash.timeout())
            .with_metrics(Arc::clone(&metrics.metrics)),
    );

    let inner: Arc<dyn Stasher> = match keydb {
        Some(pool) => {
            let node_id = coordination::node::node_id();
            tracing::info!(%node_id, "fleet-wide stash locking enabled");
            Arc::new(
                LockedStasher::new(
                    fetch,
                    storage,
                    Arc::new(pool.clone()),
                    node_id,
                    config.stash.lock_ttl,
                    Duration::from_secs(config.stash.lock_wait_timeout),
                )
                .with_metrics(Arc::clone(&metrics.metrics)),
            )
        }
        None => fetch,
    };

    Arc::new(Singleflight::new(inner).with_metrics(Arc::clone(&metrics.metrics)))
}

fn build_queue(config: &Config, keydb: Option<&Pool>) -> Arc<dyn WorkQueue> {
    match keydb {
        Some(pool) => {
            let consumer = coordination::node::consumer_id();
            tracing::info!(queue = %config.jobs.queue, %consumer, "using KeyDB job queue");
            Arc::new(KeyDbQueue::new(
                Arc::new(pool.clone()),
                config.jobs.queue.clone(),
                &consumer,
                Duration::from_millis(config.jobs.poll_interval_ms),
            ))
        }
        None => {
            tracing::info!("using in-process job queue");
            Arc::new(MemoryQueue::new())
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(
    config: &Config,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr = config
        .proxy
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        r = ctrl_c => { r?; tracing::info!("received SIGINT") },
        r = terminate => { r?; tracing::info!("received SIGTERM") },
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting modcache");

    // ---- Infrastructure clients ----
    let keydb = match &config.keydb {
        Some(keydb_config) => Some(coordination::redis::create_keydb_pool(keydb_config).await?),
        None => None,
    };
    let storage = build_storage(&config).await?;

    let http_client = reqwest::Client::builder()
        .user_agent(concat!("modcache/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Protocol stack ----
    let upstream: Arc<dyn Protocol> = Arc::new(GoProxy::new(
        http_client.clone(),
        &config.upstream.url,
        Duration::from_secs(config.upstream.request_timeout),
    ));
    let filter: Arc<dyn FilterPolicy> =
        Arc::new(ModFilter::from_config(&config.filter).context("invalid filter configuration")?);
    let stasher = build_stasher(
        &config,
        Arc::clone(&upstream),
        Arc::clone(&storage),
        keydb.as_ref(),
        &metrics,
    );
    let protocol: Arc<dyn Protocol> = Arc::new(
        CacheFirst::new(Arc::clone(&upstream), Arc::clone(&storage), Arc::clone(&stasher))
            .with_filter(Arc::clone(&filter))
            .with_metrics(Arc::clone(&metrics.metrics)),
    );

    // ---- Background jobs ----
    let queue = build_queue(&config, keydb.as_ref());
    let interceptor = MissInterceptor::new(Arc::clone(&filter), Arc::clone(&queue))
        .with_metrics(Arc::clone(&metrics.metrics));
    let reporter = CacheMissReporter::new(
        Arc::clone(&filter),
        Arc::clone(&queue),
        http_client.clone(),
        &config.tracking.endpoint,
        Duration::from_secs(config.tracking.timeout),
        config.jobs.max_try_count,
    )
    .context("invalid tracking endpoint")?
    .with_metrics(Arc::clone(&metrics.metrics));
    let fetcher = CacheMissFetcher::new(stasher, Arc::clone(&queue), filter)
        .with_metrics(Arc::clone(&metrics.metrics));
    let runner = Arc::new(
        JobRunner::new(reporter, fetcher).with_metrics(Arc::clone(&metrics.metrics)),
    );

    queue
        .recover()
        .await
        .context("failed to recover unacknowledged jobs")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let workers = jobs::run_workers(
        Arc::clone(&queue),
        runner,
        config.jobs.workers,
        shutdown_rx.clone(),
    );
    tracing::info!(workers = config.jobs.workers, "job workers started");

    // ---- App state ----
    let state = AppState {
        protocol,
        interceptor: Arc::new(interceptor),
        storage: Arc::clone(&storage),
        metrics,
        health: HealthState {
            storage,
            http_client,
            upstream_url: config.upstream.url.clone(),
            keydb,
        },
    };

    tokio::spawn({
        let shutdown_tx = Arc::clone(&shutdown_tx);
        async move {
            if let Err(e) = shutdown_signal().await {
                tracing::error!(error = %e, "signal handling failed");
            }
            let _ = shutdown_tx.send(true);
        }
    });

    // ---- Serve until shutdown ----
    let served = run_http_server(&config, state, shutdown_rx).await;
    let _ = shutdown_tx.send(true);

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "job worker panicked");
        }
    }

    served?;
    tracing::info!("modcache shut down cleanly");
    Ok(())
}
