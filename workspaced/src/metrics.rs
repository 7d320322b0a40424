use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct JobOutcomeLabels {
    outcome: JobOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum JobOutcome {
    Ready,
    Failed,
    LockBusy,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AttemptLabels {
    result: AttemptResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum AttemptResult {
    Success,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SnapshotLabels {
    result: SnapshotResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SnapshotResult {
    /// New snapshot kept.
    Created,
    /// Nothing changed since the previous snapshot; new one discarded.
    Unchanged,
    /// Empty snapshot created for a cold volume.
    Baseline,
    /// Volume busy, latest existing snapshot served instead.
    Fallback,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FetchLabels {
    result: FetchResult,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FetchResult {
    NotModified,
    AlreadyPresent,
    Received,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorTypeLabels {
    error_type: String,
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics for the daemon.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    start_jobs_total: Family<JobOutcomeLabels, Counter>,
    start_attempts_total: Family<AttemptLabels, Counter>,
    start_duration_seconds: Histogram,
    snapshots_total: Family<SnapshotLabels, Counter>,
    fetches_total: Family<FetchLabels, Counter>,
    locks_lost_total: Counter,
    errors_total: Family<ErrorTypeLabels, Counter>,
    start_time: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let start_jobs_total = Family::<JobOutcomeLabels, Counter>::default();
        registry.register(
            "workspaced_start_jobs",
            "Finished workspace start jobs by outcome",
            start_jobs_total.clone(),
        );

        let start_attempts_total = Family::<AttemptLabels, Counter>::default();
        registry.register(
            "workspaced_start_attempts",
            "Sandbox creation attempts by result",
            start_attempts_total.clone(),
        );

        // 0.5s to ~4min
        let start_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 10));
        registry.register(
            "workspaced_start_duration_seconds",
            "Time from job claim to terminal status",
            start_duration_seconds.clone(),
        );

        let snapshots_total = Family::<SnapshotLabels, Counter>::default();
        registry.register(
            "workspaced_snapshots",
            "Snapshot requests by result",
            snapshots_total.clone(),
        );

        let fetches_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "workspaced_volume_fetches",
            "Remote volume fetches by result",
            fetches_total.clone(),
        );

        let locks_lost_total = Counter::default();
        registry.register(
            "workspaced_locks_lost",
            "User locks lost while a job was running",
            locks_lost_total.clone(),
        );

        let errors_total = Family::<ErrorTypeLabels, Counter>::default();
        registry.register(
            "workspaced_errors",
            "Errors by type",
            errors_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                start_jobs_total,
                start_attempts_total,
                start_duration_seconds,
                snapshots_total,
                fetches_total,
                locks_lost_total,
                errors_total,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_job(&self, outcome: JobOutcome, duration: Duration) {
        self.inner
            .start_jobs_total
            .get_or_create(&JobOutcomeLabels { outcome })
            .inc();
        self.inner
            .start_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_attempt(&self, success: bool) {
        let result = if success {
            AttemptResult::Success
        } else {
            AttemptResult::Error
        };
        self.inner
            .start_attempts_total
            .get_or_create(&AttemptLabels { result })
            .inc();
    }

    pub fn record_snapshot(&self, result: SnapshotResult) {
        self.inner
            .snapshots_total
            .get_or_create(&SnapshotLabels { result })
            .inc();
    }

    pub fn record_fetch(&self, result: FetchResult) {
        self.inner
            .fetches_total
            .get_or_create(&FetchLabels { result })
            .inc();
    }

    pub fn record_lock_lost(&self) {
        self.inner.locks_lost_total.inc();
    }

    pub fn record_error(&self, error_type: &str) {
        self.inner
            .errors_total
            .get_or_create(&ErrorTypeLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> String {
        let mut buf = String::new();
        let registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = encode(&mut buf, &registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buf
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// HTTP routes
// ---------------------------------------------------------------------------

async fn metrics_handler(State(metrics): State<MetricsRegistry>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        metrics.encode_metrics(),
    )
}

async fn healthz_handler(State(metrics): State<MetricsRegistry>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": metrics.uptime_seconds(),
    });
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
}

/// `/metrics` and `/healthz`, ready to merge into the node router.
pub fn routes(metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
