//! Timeout enforcement.
//!
//! # Responsibilities
//! - Derive the effective deadline for a backend call
//! - Wrap backend calls with that deadline
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - The nominal timeout gets a fixed buffer so we never race the backend's
//!   own deadline
//! - A timeout aborts only the call it wraps

use std::future::Future;
use std::time::Duration;

use tokio::time::error::Elapsed;

/// Nominal timeout plus scheduling slack.
pub fn effective_timeout(nominal: Duration, buffer: Duration) -> Duration {
    nominal.saturating_add(buffer)
}

/// Run `future` under `nominal + buffer`.
pub async fn with_deadline<F: Future>(
    nominal: Duration,
    buffer: Duration,
    future: F,
) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(effective_timeout(nominal, buffer), future).await
}
