//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! - `/healthz`: liveness, 200 while the process runs
//! - `/readyz`: readiness, 200 once the controller is running
//! - `/metrics`: Prometheus text format, every series prefixed `flinkoperator_`

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::{Metric, Registry};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Per-application label set.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl ReconcileLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for ReconcileLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("phase", self.phase.as_str()).encode(encoder.encode_label())
    }
}

/// Source and target phase of a transition.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TransitionLabels {
    pub from: String,
    pub to: String,
}

impl EncodeLabelSet for TransitionLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("from", self.from.as_str()).encode(encoder.encode_label())?;
        ("to", self.to.as_str()).encode(encoder.encode_label())
    }
}

const METRIC_PREFIX: &str = "flinkoperator";

/// Register `metric` under the operator prefix and hand it back.
fn register<M>(registry: &mut Registry, name: &str, help: &str, metric: M) -> M
where
    M: Metric + Clone,
{
    registry.register(format!("{METRIC_PREFIX}_{name}"), help, metric.clone());
    metric
}

/// Operator metrics, exported on `/metrics`.
pub struct Metrics {
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Cached applications per phase, refreshed after every reconcile.
    pub applications_total: Family<PhaseLabels, Gauge>,
    pub phase_transitions_total: Family<TransitionLabels, Counter>,
    /// Task managers registered with the job manager.
    pub task_managers_total: Family<ReconcileLabels, Gauge>,
    /// Task managers whose last heartbeat is inside the threshold.
    pub task_managers_healthy: Family<ReconcileLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let r = &mut registry;

        let reconciliations_total =
            register(r, "reconciliations", "Total number of reconciliations", Family::default());
        let reconciliation_errors_total = register(
            r,
            "reconciliation_errors",
            "Total number of reconciliation errors",
            Family::default(),
        );
        let reconcile_duration_seconds = register(
            r,
            "reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            }),
        );
        let applications_total = register(
            r,
            "applications",
            "Number of FlinkApplication resources by phase",
            Family::default(),
        );
        let phase_transitions_total = register(
            r,
            "phase_transitions",
            "Total number of application phase transitions",
            Family::default(),
        );
        let task_managers_total = register(
            r,
            "task_managers",
            "Task managers registered with the job manager",
            Family::default(),
        );
        let task_managers_healthy = register(
            r,
            "task_managers_healthy",
            "Task managers with a heartbeat inside the freshness threshold",
            Family::default(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            applications_total,
            phase_transitions_total,
            task_managers_total,
            task_managers_healthy,
            registry,
        }
    }

    /// Count a completed reconcile and its duration.
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ReconcileLabels::new(namespace, name))
            .inc();
    }

    pub fn set_applications_by_phase(&self, phase: &str, count: i64) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.applications_total.get_or_create(&labels).set(count);
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        let labels = TransitionLabels {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.phase_transitions_total.get_or_create(&labels).inc();
    }

    pub fn set_task_managers(&self, namespace: &str, name: &str, total: i64, healthy: i64) {
        let labels = ReconcileLabels::new(namespace, name);
        self.task_managers_total.get_or_create(&labels).set(total);
        self.task_managers_healthy.get_or_create(&labels).set(healthy);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        match encode(&mut buffer, &self.registry) {
            Ok(()) => buffer,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                "# Error encoding metrics".to_string()
            }
        }
    }
}

/// State shared by the probe and metrics handlers.
pub struct HealthState {
    /// Set once the controller runs (after leadership, when enabled).
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Not ready until [`HealthState::set_ready`] is called.
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness: the process answers.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness: 200 once the controller runs, 503 before.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Router serving `/healthz`, `/readyz` and `/metrics`.
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:<port>`.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
