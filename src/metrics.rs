use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ArtifactLabels {
    pub artifact: Artifact,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Artifact {
    Info,
    Mod,
    Zip,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
    pub job: JobKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum JobKind {
    Report,
    Fetch,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- cache --
    pub cache_hits: Family<ArtifactLabels, Counter>,
    pub cache_misses: Family<ArtifactLabels, Counter>,

    // -- stash --
    pub stash_total: Family<OutcomeLabels, Counter>,
    pub stash_duration_seconds: Histogram,
    pub stash_coalesced: Counter,

    // -- locks --
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,

    // -- background jobs --
    pub jobs_enqueued: Family<JobLabels, Counter>,
    pub jobs_failed: Family<JobLabels, Counter>,
    pub jobs_dropped: Family<JobLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Family::<ArtifactLabels, Counter>::default();
        registry.register(
            "modcache_cache_hits",
            "Artifact reads served straight from storage",
            cache_hits.clone(),
        );

        let cache_misses = Family::<ArtifactLabels, Counter>::default();
        registry.register(
            "modcache_cache_misses",
            "Artifact reads that had to stash from upstream",
            cache_misses.clone(),
        );

        let stash_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "modcache_stash",
            "Upstream fetch-and-save executions by outcome",
            stash_total.clone(),
        );

        let stash_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 14));
        registry.register(
            "modcache_stash_duration_seconds",
            "Upstream fetch-and-save latency in seconds",
            stash_duration_seconds.clone(),
        );

        let stash_coalesced = Counter::default();
        registry.register(
            "modcache_stash_coalesced",
            "Stash calls that joined an in-flight fetch instead of starting one",
            stash_coalesced.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "modcache_lock_waits",
            "Stashes that waited for another node's lock",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "modcache_lock_timeouts",
            "Stashes that gave up waiting for another node's lock",
            lock_timeouts.clone(),
        );

        let jobs_enqueued = Family::<JobLabels, Counter>::default();
        registry.register(
            "modcache_jobs_enqueued",
            "Background jobs enqueued by kind",
            jobs_enqueued.clone(),
        );

        let jobs_failed = Family::<JobLabels, Counter>::default();
        registry.register(
            "modcache_jobs_failed",
            "Background job executions that failed",
            jobs_failed.clone(),
        );

        let jobs_dropped = Family::<JobLabels, Counter>::default();
        registry.register(
            "modcache_jobs_dropped",
            "Fetch jobs abandoned after exhausting their retry budget",
            jobs_dropped.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            stash_total,
            stash_duration_seconds,
            stash_coalesced,
            lock_waits,
            lock_timeouts,
            jobs_enqueued,
            jobs_failed,
            jobs_dropped,
        }
    }

    pub fn hit(&self, artifact: Artifact) {
        self.cache_hits.get_or_create(&ArtifactLabels { artifact }).inc();
    }

    pub fn miss(&self, artifact: Artifact) {
        self.cache_misses.get_or_create(&ArtifactLabels { artifact }).inc();
    }

    pub fn job_enqueued(&self, job: JobKind) {
        self.jobs_enqueued.get_or_create(&JobLabels { job }).inc();
    }

    pub fn job_failed(&self, job: JobKind) {
        self.jobs_failed.get_or_create(&JobLabels { job }).inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
