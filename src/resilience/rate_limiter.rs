//! Per-backend admission control.
//!
//! # Responsibilities
//! - Cap requests per minute, per second, and per 100 ms burst window
//! - Apply punitive exponential backoff after recorded failures
//! - Expose per-backend statistics for health reporting
//!
//! # Design Decisions
//! - Sliding windows over recorded timestamps, not token buckets
//! - Acquisitions for one backend are serialized by an async gate held across
//!   waits; unrelated backends never contend
//! - Timestamps and failure state live behind short synchronous locks so
//!   recording outcomes and reading stats never wait on a sleeping acquirer
//! - Every wait is a timer, and each condition is re-checked after waking

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::RateLimitConfig;
use crate::observability::metrics;
use crate::resilience::backoff::failure_backoff;

const MINUTE: Duration = Duration::from_secs(60);
const SECOND: Duration = Duration::from_secs(1);
const BURST_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Penalty {
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct BackendLimiter {
    /// Serializes acquisitions for this backend.
    gate: tokio::sync::Mutex<()>,
    /// Request timestamps within the trailing minute, oldest first.
    window: Mutex<VecDeque<Instant>>,
    penalty: Mutex<Penalty>,
}

impl BackendLimiter {
    fn window(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn penalty(&self) -> MutexGuard<'_, Penalty> {
        self.penalty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop timestamps older than a minute and count those inside `span`.
    /// Returns the timestamp whose expiry brings the count below `limit`.
    fn blocking_entry(&self, now: Instant, span: Duration, limit: u32) -> Option<Instant> {
        let mut window = self.window();
        while window.front().is_some_and(|&t| now.saturating_duration_since(t) >= MINUTE) {
            window.pop_front();
        }
        let recent: Vec<Instant> = window
            .iter()
            .copied()
            .filter(|&t| now.saturating_duration_since(t) < span)
            .collect();
        let limit = limit.max(1) as usize;
        if recent.len() >= limit {
            Some(recent[recent.len() - limit])
        } else {
            None
        }
    }
}

/// Snapshot of one backend's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub requests_last_minute: usize,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub backoff_until: Option<Instant>,
    pub backoff_remaining_ms: u64,
    pub is_backing_off: bool,
}

/// Rate limiter keyed by backend identifier.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    backends: DashMap<String, Arc<BackendLimiter>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            backends: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// State for `backend`, created lazily on first use.
    fn backend(&self, backend: &str) -> Arc<BackendLimiter> {
        if let Some(existing) = self.backends.get(backend) {
            return existing.clone();
        }
        self.backends
            .entry(backend.to_string())
            .or_default()
            .clone()
    }

    /// Wait until a request to `backend` is allowed, then record it.
    ///
    /// Never fails; it only delays. Dropping the future abandons the wait
    /// without recording a request.
    pub async fn acquire(&self, backend: &str) {
        let limiter = self.backend(backend);
        let _gate = limiter.gate.lock().await;

        self.wait_window(&limiter, backend, MINUTE, self.config.requests_per_minute, "per_minute")
            .await;
        self.wait_window(&limiter, backend, SECOND, self.config.requests_per_second, "per_second")
            .await;

        if limiter
            .blocking_entry(Instant::now(), BURST_WINDOW, self.config.burst_limit)
            .is_some()
        {
            tracing::info!(backend, wait_ms = BURST_WINDOW.as_millis() as u64, "Rate limit: burst limit reached, waiting");
            metrics::record_rate_limit_wait(backend, "burst");
            sleep(BURST_WINDOW).await;
        }

        loop {
            let until = limiter.penalty().backoff_until;
            match until {
                Some(until) if until > Instant::now() => {
                    tracing::info!(
                        backend,
                        wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Rate limit: failure backoff, waiting"
                    );
                    metrics::record_rate_limit_wait(backend, "backoff");
                    sleep_until(until).await;
                }
                _ => break,
            }
        }

        limiter.window().push_back(Instant::now());
    }

    async fn wait_window(
        &self,
        limiter: &BackendLimiter,
        backend: &str,
        span: Duration,
        limit: u32,
        reason: &'static str,
    ) {
        while let Some(oldest) = limiter.blocking_entry(Instant::now(), span, limit) {
            let until = oldest + span;
            tracing::info!(
                backend,
                reason,
                wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Rate limit: window full, waiting"
            );
            metrics::record_rate_limit_wait(backend, reason);
            sleep_until(until).await;
        }
    }

    /// Clear punitive backoff after a successful request.
    pub fn record_success(&self, backend: &str) {
        let limiter = self.backend(backend);
        let mut penalty = limiter.penalty();
        penalty.consecutive_failures = 0;
        penalty.backoff_until = None;
        tracing::debug!(backend, "Rate limiter: success recorded");
    }

    /// Extend punitive backoff after a failed request.
    pub fn record_failure(&self, backend: &str) {
        let limiter = self.backend(backend);
        let mut penalty = limiter.penalty();
        penalty.consecutive_failures = penalty.consecutive_failures.saturating_add(1);
        let backoff = failure_backoff(
            penalty.consecutive_failures,
            self.config.backoff_multiplier,
            self.config.max_backoff_secs,
        );
        penalty.backoff_until = Some(Instant::now() + backoff);
        tracing::warn!(
            backend,
            backoff_ms = backoff.as_millis() as u64,
            consecutive_failures = penalty.consecutive_failures,
            "Rate limiter: failure recorded"
        );
    }

    /// Statistics for one backend, if it has been seen.
    pub fn backend_stats(&self, backend: &str) -> Option<RateLimitStats> {
        let limiter = self.backends.get(backend)?.clone();
        Some(Self::snapshot(&limiter))
    }

    /// Statistics for every backend seen so far.
    pub fn stats(&self) -> BTreeMap<String, RateLimitStats> {
        self.backends
            .iter()
            .map(|entry| (entry.key().clone(), Self::snapshot(entry.value())))
            .collect()
    }

    fn snapshot(limiter: &BackendLimiter) -> RateLimitStats {
        let now = Instant::now();
        let requests_last_minute = limiter
            .window()
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < MINUTE)
            .count();
        let penalty = limiter.penalty();
        let remaining = penalty
            .backoff_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        RateLimitStats {
            requests_last_minute,
            consecutive_failures: penalty.consecutive_failures,
            backoff_until: penalty.backoff_until,
            backoff_remaining_ms: remaining.as_millis() as u64,
            is_backing_off: !remaining.is_zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, per_second: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_second: per_second,
            burst_limit: burst,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_limit_delays_next_acquisition() {
        let limiter = limiter(3, 100, 100);
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire("a").await;
        }
        assert!(start.elapsed() < SECOND);

        limiter.acquire("a").await;
        assert!(start.elapsed() >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_second_limit() {
        let limiter = limiter(100, 2, 100);
        let start = Instant::now();
        limiter.acquire("a").await;
        limiter.acquire("a").await;
        limiter.acquire("a").await;
        assert!(start.elapsed() >= SECOND);
        assert!(start.elapsed() < MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_limit() {
        let limiter = limiter(100, 100, 2);
        let start = Instant::now();
        limiter.acquire("a").await;
        limiter.acquire("a").await;
        limiter.acquire("a").await;
        assert!(start.elapsed() >= BURST_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backends_are_independent() {
        let limiter = limiter(1, 100, 100);
        let start = Instant::now();
        limiter.acquire("a").await;
        limiter.acquire("b").await;
        limiter.acquire("c").await;
        assert!(start.elapsed() < SECOND);
        assert_eq!(limiter.stats().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backoff_and_reset() {
        let limiter = limiter(100, 100, 100);
        limiter.acquire("a").await;

        limiter.record_failure("a");
        limiter.record_failure("a");
        let stats = limiter.backend_stats("a").unwrap();
        assert_eq!(stats.consecutive_failures, 2);
        assert!(stats.is_backing_off);
        assert_eq!(stats.backoff_remaining_ms, 4000);

        let start = Instant::now();
        limiter.acquire("a").await;
        assert!(start.elapsed() >= Duration::from_secs(4));

        limiter.record_success("a");
        let stats = limiter.backend_stats("a").unwrap();
        assert_eq!(stats.consecutive_failures, 0);
        assert!(!stats.is_backing_off);
        assert!(stats.backoff_until.is_none());
        assert_eq!(stats.requests_last_minute, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backoff_is_capped() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_backoff_secs: 10.0,
            ..Default::default()
        });
        for _ in 0..20 {
            limiter.record_failure("a");
        }
        let stats = limiter.backend_stats("a").unwrap();
        assert_eq!(stats.backoff_remaining_ms, 10_000);
    }
}
