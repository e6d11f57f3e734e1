use crate::error::{ControlPlaneError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ControlPlaneError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        describe_counter!(
            "control_plane_cache_operations_total",
            "Cache engine operations by strategy and outcome"
        );

        describe_counter!(
            "control_plane_rate_limit_checks_total",
            "Rate limit checks by environment, endpoint type and decision"
        );
        describe_counter!(
            "control_plane_rate_limit_exceeded_total",
            "Requests rejected due to rate limiting"
        );
        describe_counter!(
            "control_plane_rate_limit_resolutions_total",
            "Rate limit resolutions by source"
        );

        describe_counter!(
            "control_plane_worker_executions_total",
            "Job attempts executed on worker nodes"
        );
        describe_histogram!(
            "control_plane_worker_execution_duration_seconds",
            "Job attempt latencies in seconds"
        );
        describe_gauge!(
            "control_plane_worker_healthy",
            "Worker health status (1 = active, 0 = inactive)"
        );
        describe_gauge!(
            "control_plane_worker_active_jobs",
            "Jobs currently running on a worker"
        );
        describe_gauge!("control_plane_worker_pool_size", "Registered worker nodes");
        describe_counter!(
            "control_plane_worker_scale_events_total",
            "Scaling actions applied to the worker pool"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Get the Prometheus metrics handle
    pub fn handle(&self) -> Arc<PrometheusHandle> {
        self.handle.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        service.render(),
    )
}

/// Record a cache operation (hit, miss, set, error)
pub fn record_cache_operation(strategy: &str, outcome: &'static str) {
    let labels = [("strategy", strategy.to_string()), ("outcome", outcome.to_string())];
    counter!("control_plane_cache_operations_total", &labels).increment(1);
}

/// Record a rate limit decision
pub fn record_rate_limit_check(environment: &str, endpoint_type: &str, allowed: bool) {
    let labels = [
        ("environment", environment.to_string()),
        ("endpoint_type", endpoint_type.to_string()),
        ("decision", if allowed { "allowed" } else { "rejected" }.to_string()),
    ];
    counter!("control_plane_rate_limit_checks_total", &labels).increment(1);

    if !allowed {
        let labels = [("endpoint_type", endpoint_type.to_string())];
        counter!("control_plane_rate_limit_exceeded_total", &labels).increment(1);
    }
}

/// Record where a rate limit was resolved from
pub fn record_rate_limit_resolution(source: &str) {
    let labels = [("source", source.to_string())];
    counter!("control_plane_rate_limit_resolutions_total", &labels).increment(1);
}

/// Record one job attempt on a worker
pub fn record_worker_execution(node: &str, success: bool, duration: f64) {
    let labels = [
        ("node", node.to_string()),
        ("outcome", if success { "success" } else { "failure" }.to_string()),
    ];
    counter!("control_plane_worker_executions_total", &labels).increment(1);
    histogram!("control_plane_worker_execution_duration_seconds", &labels).record(duration);
}

/// Record worker health status
pub fn record_worker_health(node: &str, healthy: bool) {
    let labels = [("node", node.to_string())];
    gauge!("control_plane_worker_healthy", &labels).set(if healthy { 1.0 } else { 0.0 });
}

/// Record jobs in flight on a worker
pub fn record_worker_active_jobs(node: &str, count: usize) {
    let labels = [("node", node.to_string())];
    gauge!("control_plane_worker_active_jobs", &labels).set(count as f64);
}

/// Record a scaling action
pub fn record_scale_event(from: usize, to: usize) {
    let direction = if to > from { "up" } else { "down" };
    let labels = [("direction", direction.to_string())];
    counter!("control_plane_worker_scale_events_total", &labels).increment(1);
    gauge!("control_plane_worker_pool_size").set(to as f64);
}
