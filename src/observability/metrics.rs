//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define ensemble metrics (backend calls, operations, limiter waits)
//! - Expose a Prometheus-compatible rendering for the `/metrics` endpoint
//! - Track per-backend and aggregate metrics
//!
//! # Metrics
//! - `ensemble_backend_requests_total` (counter): backend calls by backend, outcome
//! - `ensemble_backend_request_duration_seconds` (histogram): backend call latency
//! - `ensemble_operations_total` (counter): ensemble runs by outcome
//! - `ensemble_operation_duration_seconds` (histogram): end-to-end run latency
//! - `ensemble_circuit_state` (gauge): 0=closed, 0.5=half-open, 1=open
//! - `ensemble_rate_limit_waits_total` (counter): limiter waits by backend, reason
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed, so library users and tests pay nothing
//! - The Prometheus recorder is installed at most once per process

use std::sync::OnceLock;
use std::time::Duration;

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::resilience::CircuitState;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder, returning a handle for rendering.
///
/// Repeated calls return the handle from the first installation.
pub fn install_prometheus() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install Prometheus recorder, metrics stay local");
                PrometheusBuilder::new().build_recorder().handle()
            }
        })
        .clone()
}

/// The installed handle, if metrics are enabled.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Periodically drain histogram buckets so memory stays bounded.
pub async fn run_upkeep(handle: PrometheusHandle, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        handle.run_upkeep();
    }
}

/// One backend call finished.
pub fn record_backend_request(backend: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "ensemble_backend_requests_total",
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("ensemble_backend_request_duration_seconds", "backend" => backend.to_string())
        .record(duration.as_secs_f64());
}

/// One ensemble run finished.
pub fn record_ensemble_operation(outcome: &'static str, duration: Duration) {
    counter!("ensemble_operations_total", "outcome" => outcome).increment(1);
    histogram!("ensemble_operation_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_circuit_state(backend: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 0.5,
        CircuitState::Open => 1.0,
    };
    gauge!("ensemble_circuit_state", "backend" => backend.to_string()).set(value);
}

pub fn record_rate_limit_wait(backend: &str, reason: &'static str) {
    counter!(
        "ensemble_rate_limit_waits_total",
        "backend" => backend.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// One backend failure was recorded by the error tracker.
pub fn record_backend_error(backend: &str, category: &'static str, severity: &'static str) {
    counter!(
        "ensemble_backend_errors_total",
        "backend" => backend.to_string(),
        "category" => category,
        "severity" => severity
    )
    .increment(1);
}
