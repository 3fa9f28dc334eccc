//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: first admission check after the recovery timeout
//! Half-Open → Closed: trial request succeeds
//! Half-Open → Open: trial request fails
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global), created lazily
//! - Fail fast in Open state (no waiting for timeout)
//! - Single trial in Half-Open (prevents hammering recovering backend)
//! - Transitions are evaluated lazily on admission checks, no timers
//! - Each Half-Open trial carries an id; only its holder can release it

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests are allowed through.
    Closed,
    /// Failures exceeded threshold, requests are blocked.
    Open,
    /// Recovery mode, one trial request is allowed through.
    HalfOpen,
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The circuit is Open, or its single trial is taken.
    Rejected,
    /// Normal admission while Closed.
    Allowed,
    /// The Half-Open trial, identified so only this caller can release it.
    Trial(u64),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    pub fn trial(&self) -> Option<u64> {
        match self {
            Self::Trial(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Id of the Half-Open trial currently handed out.
    trial: Option<u64>,
    next_trial: u64,
}

impl BreakerState {
    fn grant_trial(&mut self) -> Admission {
        let id = self.next_trial;
        self.next_trial = self.next_trial.wrapping_add(1);
        self.trial = Some(id);
        Admission::Trial(id)
    }
}

/// Circuit breaker for a single backend.
///
/// All mutable state sits under one lock so transitions are atomic.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerState>,
    threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial: None,
                next_trial: 0,
            }),
            threshold: threshold.max(1),
            recovery_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a request may be issued now.
    ///
    /// In Open state, grants a trial exactly once after the recovery timeout
    /// (moving to Half-Open); further checks are rejected until that trial
    /// resolves or its holder releases it.
    pub fn can_execute(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => {
                if inner.trial.is_some() {
                    Admission::Rejected
                } else {
                    inner.grant_trial()
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    metrics::record_circuit_state(&self.name, CircuitState::HalfOpen);
                    tracing::warn!(backend = %self.name, "Circuit breaker half-open, allowing trial request");
                    inner.grant_trial()
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful request.
    ///
    /// Always resets the failure counter. Half-Open closes; a late success
    /// observed while Open leaves the circuit Open until its own trial.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.last_failure = None;
            inner.trial = None;
            metrics::record_circuit_state(&self.name, CircuitState::Closed);
            tracing::info!(backend = %self.name, "Circuit breaker closed after successful trial");
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.trial = None;
                metrics::record_circuit_state(&self.name, CircuitState::Open);
                tracing::warn!(backend = %self.name, "Circuit breaker re-opened after failed trial");
            }
            CircuitState::Closed if inner.failure_count >= self.threshold => {
                inner.state = CircuitState::Open;
                metrics::record_circuit_state(&self.name, CircuitState::Open);
                tracing::warn!(
                    backend = %self.name,
                    threshold = self.threshold,
                    "Circuit breaker opened after reaching failure threshold"
                );
            }
            _ => {}
        }
    }

    /// Release trial `id` when it ended without an outcome (cancelled,
    /// dropped or panicked). A stale id is ignored.
    pub fn release_trial(&self, id: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial == Some(id) {
            inner.trial = None;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Lazily-populated set of breakers keyed by backend.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// The breaker for `backend`, created on first use.
    pub fn get(&self, backend: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(backend) {
            return existing.clone();
        }
        self.breakers
            .entry(backend.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    backend,
                    self.config.failure_threshold,
                    Duration::from_secs(self.config.recovery_timeout_secs),
                ))
            })
            .clone()
    }

    /// The breaker for `backend` if one exists.
    pub fn peek(&self, backend: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(backend).map(|b| b.clone())
    }

    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                (
                    entry.key().clone(),
                    CircuitSnapshot {
                        state: breaker.state(),
                        failure_count: breaker.failure_count(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker() {
        let breaker = CircuitBreaker::new("a", 3, Duration::from_secs(60));

        assert!(breaker.can_execute().is_allowed());
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..3 {
            breaker.record_failure();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_threshold() {
        let breaker = CircuitBreaker::new("a", 5, Duration::from_secs(60));

        for i in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
            assert_eq!(breaker.failure_count(), i + 1);
        }

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_recovery_timeout() {
        let breaker = CircuitBreaker::new("a", 2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!breaker.can_execute().is_allowed());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute().is_allowed());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_execute().is_allowed());
        assert!(!breaker.can_execute().is_allowed());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("a", 1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.can_execute().is_allowed());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute().is_allowed());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.can_execute().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new("a", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_while_open_keeps_circuit_open() {
        let breaker = CircuitBreaker::new("a", 1, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 0);
        assert!(!breaker.can_execute().is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_can_be_retaken() {
        let breaker = CircuitBreaker::new("a", 1, Duration::from_secs(1));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.can_execute().trial().unwrap();
        assert_eq!(breaker.can_execute(), Admission::Rejected);
        breaker.release_trial(trial);
        assert!(matches!(breaker.can_execute(), Admission::Trial(id) if id != trial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_release_keeps_current_trial() {
        let breaker = CircuitBreaker::new("a", 1, Duration::from_secs(10));
        assert_eq!(breaker.can_execute(), Admission::Allowed);

        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        let first = breaker.can_execute().trial().unwrap();
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(10)).await;
        let second = breaker.can_execute().trial().unwrap();
        assert_ne!(first, second);

        // The first trial already resolved; releasing it again must not
        // free the slot held by the second.
        breaker.release_trial(first);
        assert_eq!(breaker.can_execute(), Admission::Rejected);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_registry_is_lazy_and_keyed() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
        });
        assert!(registry.peek("a").is_none());
        registry.get("a").record_failure();
        assert_eq!(registry.get("a").state(), CircuitState::Open);
        assert_eq!(registry.get("b").state(), CircuitState::Closed);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
