//! Single-backend request driver.
//!
//! # Responsibilities
//! - Gate each call through the circuit breaker and the rate limiter
//! - Enforce the per-call deadline
//! - Retry transient failures with exponential backoff
//! - Report every outcome to the limiter, the breaker and the monitor,
//!   and every failure to the error history
//!
//! # Design Decisions
//! - Never fails across its boundary: every outcome is a `BackendResponse`
//! - Retryability is decided once, from the client's error text
//! - An open circuit fails fast without consuming rate-limit budget
//! - Cancellation is not a backend fault and leaves breaker and limiter untouched
//! - A Half-Open trial is released when its call ends without an outcome,
//!   including when the call future is dropped or unwinds

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::{ChatClient, ChatPrompt};
use crate::config::{RetryConfig, TimeoutConfig};
use crate::observability::{PerformanceMonitor, RequestOutcome, RequestTracker};
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::timeouts::effective_timeout;
use crate::security::redact;

/// Marker that prefixes every rendered backend failure.
pub const ERROR_MARKER: &str = "Error:";

/// Classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CircuitOpen,
    Timeout,
    RateLimited,
    Backend,
    EmptyResponse,
    Panicked,
    Cancelled,
    RetriesExhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Backend => "backend",
            Self::EmptyResponse => "empty_response",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }

    /// Transient failures are retried within the attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-band failure of one backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Error: {message}")]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl BackendFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Result of driving one backend call.
pub type BackendResponse = Result<String, BackendFailure>;

/// Classify a client error message. Only "rate limit" and "timeout" phrasing
/// is considered transient.
pub fn classify_error(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        FailureKind::RateLimited
    } else if lower.contains("timeout") {
        FailureKind::Timeout
    } else {
        FailureKind::Backend
    }
}

/// Whether a client error message describes a transient condition.
pub fn is_transient(message: &str) -> bool {
    classify_error(message).is_transient()
}

/// Retry and deadline policy for backend calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Slack added to every nominal timeout.
    pub timeout_buffer: Duration,
}

impl RetryPolicy {
    pub fn from_config(retries: &RetryConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            max_attempts: retries.max_attempts,
            base_delay: Duration::from_millis(retries.base_delay_ms),
            max_delay: Duration::from_millis(retries.max_delay_ms),
            jitter_ratio: retries.jitter_ratio,
            timeout_buffer: timeouts.buffer(),
        }
    }

    /// Sleep before the retry that follows attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay, self.max_delay, self.jitter_ratio)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), &TimeoutConfig::default())
    }
}

/// Gives back a Half-Open trial when dropped. Resolved trials are ignored
/// by the breaker, so this is safe on every exit path.
struct TrialRelease<'a> {
    breaker: &'a CircuitBreaker,
    id: u64,
}

impl Drop for TrialRelease<'_> {
    fn drop(&mut self) {
        self.breaker.release_trial(self.id);
    }
}

/// A driven call together with its recorded measurement.
#[derive(Debug, Clone)]
pub struct DrivenResponse {
    pub response: BackendResponse,
    pub outcome: RequestOutcome,
}

/// Executes single backend calls against shared resilience state.
#[derive(Debug, Clone)]
pub struct RequestDriver {
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: Arc<PerformanceMonitor>,
    policy: RetryPolicy,
}

impl RequestDriver {
    pub fn new(
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        monitor: Arc<PerformanceMonitor>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            breakers,
            monitor,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `prompt` to `backend`. Never panics or errors across this boundary.
    pub async fn send(
        &self,
        client: &dyn ChatClient,
        prompt: &ChatPrompt,
        backend: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> BackendResponse {
        self.send_tracked(client, prompt, backend, timeout, cancel)
            .await
            .response
    }

    /// Like [`send`](Self::send), also returning the recorded outcome.
    pub async fn send_tracked(
        &self,
        client: &dyn ChatClient,
        prompt: &ChatPrompt,
        backend: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DrivenResponse {
        let tracker = self.monitor.start_request(backend);
        let breaker = self.breakers.get(backend);

        let admission = breaker.can_execute();
        if !admission.is_allowed() {
            tracing::warn!(backend, "Circuit breaker open, skipping backend");
            let failure = BackendFailure::new(
                FailureKind::CircuitOpen,
                format!("circuit breaker open for {backend}"),
            );
            return self.finish(tracker, Err(failure), 0);
        }
        let _trial = admission.trial().map(|id| TrialRelease {
            breaker: &breaker,
            id,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.cancelled(tracker, 0);
            }
            _ = self.limiter.acquire(backend) => {}
        }

        let deadline = effective_timeout(timeout, self.policy.timeout_buffer);

        for attempt in 0..self.policy.max_attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.cancelled(tracker, attempt + 1);
                }
                result = tokio::time::timeout(deadline, client.complete(backend, prompt)) => result,
            };

            let failure = match result {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    self.limiter.record_success(backend);
                    breaker.record_success();
                    return self.finish(tracker, Ok(text), attempt + 1);
                }
                Ok(Ok(_)) => BackendFailure::new(FailureKind::EmptyResponse, "empty response from backend"),
                Ok(Err(e)) => {
                    let message = redact(&e.to_string());
                    BackendFailure::new(classify_error(&message), message)
                }
                Err(_) => BackendFailure::new(
                    FailureKind::Timeout,
                    format!("request timeout after {:.1}s", deadline.as_secs_f64()),
                ),
            };

            let attempts_left = attempt + 1 < self.policy.max_attempts;
            if failure.kind.is_transient() && attempts_left {
                let delay = self.policy.delay(attempt);
                tracing::info!(
                    backend,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure.message,
                    "Transient backend failure, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.cancelled(tracker, attempt + 1);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            return self.fail(tracker, &breaker, backend, failure, attempt + 1);
        }

        let failure = BackendFailure::new(FailureKind::RetriesExhausted, "max retries exceeded");
        self.fail(tracker, &breaker, backend, failure, self.policy.max_attempts)
    }

    /// Record a call that panicked before producing an outcome.
    pub fn record_panic(&self, backend: &str, message: String) -> DrivenResponse {
        tracing::error!(backend, panic = %message, "Backend call panicked");
        let tracker = self.monitor.start_request(backend);
        let failure = BackendFailure::new(
            FailureKind::Panicked,
            format!("backend task panicked: {}", redact(&message)),
        );
        self.monitor.record_failure(backend, &failure);
        self.finish(tracker, Err(failure), 0)
    }

    fn fail(
        &self,
        tracker: RequestTracker,
        breaker: &CircuitBreaker,
        backend: &str,
        failure: BackendFailure,
        attempts: u32,
    ) -> DrivenResponse {
        self.limiter.record_failure(backend);
        breaker.record_failure();
        tracing::warn!(
            backend,
            attempts,
            kind = %failure.kind,
            error = %failure.message,
            "Backend request failed"
        );
        self.monitor.record_failure(backend, &failure);
        self.finish(tracker, Err(failure), attempts)
    }

    fn cancelled(&self, tracker: RequestTracker, attempts: u32) -> DrivenResponse {
        let failure = BackendFailure::new(FailureKind::Cancelled, "request cancelled");
        self.finish(tracker, Err(failure), attempts)
    }

    fn finish(&self, tracker: RequestTracker, response: BackendResponse, attempts: u32) -> DrivenResponse {
        let measured = match &response {
            Ok(text) => Ok(text.len()),
            Err(failure) => Err(failure.kind),
        };
        let outcome = self.monitor.finish_request(tracker, measured, attempts);
        DrivenResponse { response, outcome }
    }
}
