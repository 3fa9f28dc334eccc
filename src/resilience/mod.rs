//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend (retries.rs, RequestDriver):
//!     → circuit_breaker.rs (fail fast while the backend is open)
//!     → rate_limiter.rs (wait for per-minute, per-second, burst, backoff)
//!     → timeouts.rs (enforce request timeout + buffer)
//!     → On transient failure: backoff.rs delay, retry
//!     → Outcome recorded to limiter, breaker and monitor
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Only timeouts and backend rate limiting are retried
//! - Circuit breaker prevents hammering a failing backend
//! - All state is keyed per backend and owned by the orchestrator, never global

pub mod backoff;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use rate_limiter::{RateLimitStats, RateLimiter};
pub use retries::{
    classify_error, is_transient, BackendFailure, BackendResponse, DrivenResponse, FailureKind,
    RequestDriver, RetryPolicy, ERROR_MARKER,
};
