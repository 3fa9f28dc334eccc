//! Correlation spans.
//!
//! Every ensemble run executes inside an `ensemble` span carrying a fresh
//! correlation ID, so backend, retry, and refinement events can be grouped.
//! The HTTP layer reuses the inbound `x-request-id` when one is present.

use tracing::Span;
use uuid::Uuid;

/// Create a new correlation ID.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Root span for one ensemble run.
pub fn ensemble_span(correlation_id: &str, backends: usize) -> Span {
    tracing::info_span!("ensemble", correlation_id = %correlation_id, backends)
}

/// Span for one backend call inside a run.
pub fn backend_span(backend: &str) -> Span {
    tracing::debug_span!("backend", backend = %backend)
}
