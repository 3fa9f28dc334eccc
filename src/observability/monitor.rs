//! In-process performance monitor.
//!
//! # Data Flow
//! ```text
//! RequestDriver:  start_request(backend) → RequestTracker → finish_request → RequestOutcome
//! Orchestrator:   start_ensemble(prompt_len) → EnsembleTracker
//!                     ← add_request(RequestOutcome) per backend
//!                 finish_ensemble(RunCompletion) → EnsembleOutcome
//! RequestDriver:  record_failure → ErrorTracker
//! Readers:        backend_stats / ensemble_stats / errors (health checks, /stats)
//! ```
//!
//! # Design Decisions
//! - Trackers are consumed when finished, so an outcome is recorded once
//! - Only successful calls contribute latency samples
//! - A run succeeds when it answered without falling back after a failed
//!   refinement; skipping refinement for a single answer is still a success
//! - Durations come from the tokio clock, timestamps from the wall clock
//! - History is bounded: `max_history` operations, `latency_window` samples
//!   per backend
//! - The same events are mirrored to the `metrics` facade

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;

use crate::observability::errors::ErrorTracker;
use crate::observability::metrics;
use crate::resilience::{BackendFailure, FailureKind};

/// In-flight measurement of one backend call.
#[derive(Debug)]
#[must_use = "a tracker records nothing until it is finished"]
pub struct RequestTracker {
    backend: String,
    started_at: Instant,
    started_wall: SystemTime,
}

impl RequestTracker {
    /// Close the measurement. `Ok` carries the response length.
    pub fn finish(self, result: Result<usize, FailureKind>, attempts: u32) -> RequestOutcome {
        let (success, response_len, error) = match result {
            Ok(len) => (true, len, None),
            Err(kind) => (false, 0, Some(kind)),
        };
        let duration = self.started_at.elapsed();
        RequestOutcome {
            backend: self.backend,
            started_at: self.started_wall,
            finished_at: self.started_wall + duration,
            duration,
            success,
            error,
            response_len,
            attempts,
        }
    }
}

/// Completed measurement of one backend call.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub backend: String,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<FailureKind>,
    pub response_len: usize,
    pub attempts: u32,
}

/// In-flight measurement of one ensemble run.
#[derive(Debug)]
#[must_use = "a tracker records nothing until it is finished"]
pub struct EnsembleTracker {
    started_at: Instant,
    started_wall: SystemTime,
    prompt_len: usize,
    requests: Vec<RequestOutcome>,
}

impl EnsembleTracker {
    pub fn add_request(&mut self, outcome: RequestOutcome) {
        self.requests.push(outcome);
    }

    /// Close the measurement.
    pub fn finish(self, completion: RunCompletion) -> EnsembleOutcome {
        let backends_attempted = self.requests.len();
        let backends_succeeded = self.requests.iter().filter(|r| r.success).count();
        let (completed, refined, fallback, output_len) = match completion {
            RunCompletion::Failed => (false, false, false, 0),
            RunCompletion::Answered {
                refined,
                fallback,
                output_len,
            } => (true, refined, fallback, output_len),
        };
        let duration = self.started_at.elapsed();
        EnsembleOutcome {
            started_at: self.started_wall,
            finished_at: self.started_wall + duration,
            duration,
            prompt_len: self.prompt_len,
            backends_attempted,
            backends_succeeded,
            refined,
            fallback,
            completed,
            successful: completed && !fallback,
            output_len,
            requests: self.requests,
        }
    }
}

/// How an ensemble run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCompletion {
    /// No answer was produced.
    Failed,
    Answered {
        /// The refinement model produced the answer.
        refined: bool,
        /// The answer is a fallback after refinement failed.
        fallback: bool,
        output_len: usize,
    },
}

/// Completed measurement of one ensemble run.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleOutcome {
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub duration: Duration,
    pub prompt_len: usize,
    pub backends_attempted: usize,
    pub backends_succeeded: usize,
    pub refined: bool,
    pub fallback: bool,
    pub completed: bool,
    pub successful: bool,
    pub output_len: usize,
    pub requests: Vec<RequestOutcome>,
}

impl EnsembleOutcome {
    /// Fraction of attempted backends that answered.
    pub fn success_rate(&self) -> f64 {
        if self.backends_attempted == 0 {
            0.0
        } else {
            self.backends_succeeded as f64 / self.backends_attempted as f64
        }
    }
}

/// Derived statistics for one backend.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_latency_secs: f64,
    pub p95_latency_secs: f64,
    pub p99_latency_secs: f64,
    pub error_counts: BTreeMap<String, u64>,
}

/// Derived statistics over recent ensemble runs.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct EnsembleStats {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub successful_operations: usize,
    pub refined_operations: usize,
    /// Fraction of runs that answered without a refinement fallback.
    pub operation_success_rate: f64,
    pub average_model_success_rate: f64,
    pub average_duration_secs: f64,
    pub min_duration_secs: f64,
    pub max_duration_secs: f64,
    pub p95_duration_secs: f64,
    pub p99_duration_secs: f64,
}

#[derive(Debug, Default)]
struct BackendAccumulator {
    total: u64,
    successes: u64,
    failures: u64,
    success_latency: Duration,
    errors: BTreeMap<String, u64>,
    recent_latencies: VecDeque<Duration>,
}

#[derive(Debug, Default)]
struct MonitorState {
    operations: VecDeque<EnsembleOutcome>,
    backends: BTreeMap<String, BackendAccumulator>,
}

/// Collects request and ensemble outcomes.
#[derive(Debug)]
pub struct PerformanceMonitor {
    max_history: usize,
    latency_window: usize,
    state: Mutex<MonitorState>,
    errors: ErrorTracker,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(1000, 100)
    }
}

impl PerformanceMonitor {
    pub fn new(max_history: usize, latency_window: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            latency_window: latency_window.max(1),
            state: Mutex::new(MonitorState::default()),
            errors: ErrorTracker::new(max_history),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start_request(&self, backend: &str) -> RequestTracker {
        RequestTracker {
            backend: backend.to_string(),
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
        }
    }

    /// Finish and record a backend call.
    pub fn finish_request(
        &self,
        tracker: RequestTracker,
        result: Result<usize, FailureKind>,
        attempts: u32,
    ) -> RequestOutcome {
        let outcome = tracker.finish(result, attempts);
        self.record_request(&outcome);
        outcome
    }

    /// Record an already-finished backend call.
    pub fn record_request(&self, outcome: &RequestOutcome) {
        {
            let mut state = self.lock();
            let stats = state.backends.entry(outcome.backend.clone()).or_default();
            stats.total += 1;
            if outcome.success {
                stats.successes += 1;
                stats.success_latency += outcome.duration;
                stats.recent_latencies.push_back(outcome.duration);
                while stats.recent_latencies.len() > self.latency_window {
                    stats.recent_latencies.pop_front();
                }
            } else {
                stats.failures += 1;
                if let Some(kind) = outcome.error {
                    *stats.errors.entry(kind.as_str().to_string()).or_default() += 1;
                }
            }
        }

        let label = match outcome.error {
            None => "success",
            Some(kind) => kind.as_str(),
        };
        metrics::record_backend_request(&outcome.backend, label, outcome.duration);
        tracing::debug!(
            backend = %outcome.backend,
            success = outcome.success,
            attempts = outcome.attempts,
            duration_ms = outcome.duration.as_millis() as u64,
            "Backend request finished"
        );
    }

    /// Record a backend failure in the error history.
    pub fn record_failure(&self, backend: &str, failure: &BackendFailure) {
        self.errors.record(backend, failure);
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    pub fn start_ensemble(&self, prompt_len: usize) -> EnsembleTracker {
        EnsembleTracker {
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
            prompt_len,
            requests: Vec::new(),
        }
    }

    /// Finish and record an ensemble run.
    pub fn finish_ensemble(
        &self,
        tracker: EnsembleTracker,
        completion: RunCompletion,
    ) -> EnsembleOutcome {
        let outcome = tracker.finish(completion);

        let label = if !outcome.completed {
            "failed"
        } else if outcome.fallback {
            "degraded"
        } else if outcome.refined {
            "refined"
        } else {
            "unrefined"
        };
        metrics::record_ensemble_operation(label, outcome.duration);
        tracing::info!(
            duration_ms = outcome.duration.as_millis() as u64,
            succeeded = outcome.backends_succeeded,
            attempted = outcome.backends_attempted,
            outcome = label,
            "Ensemble operation completed"
        );

        let mut state = self.lock();
        state.operations.push_back(outcome.clone());
        while state.operations.len() > self.max_history {
            state.operations.pop_front();
        }
        outcome
    }

    /// Statistics for one backend, if it has been called.
    pub fn backend_stats(&self, backend: &str) -> Option<BackendStats> {
        self.lock().backends.get(backend).map(derive_backend_stats)
    }

    /// Statistics for every backend called so far.
    pub fn all_backend_stats(&self) -> BTreeMap<String, BackendStats> {
        self.lock()
            .backends
            .iter()
            .map(|(name, acc)| (name.clone(), derive_backend_stats(acc)))
            .collect()
    }

    /// Statistics over the most recent `recent` runs (all retained runs when `None`).
    /// `None` when no run has been recorded.
    pub fn ensemble_stats(&self, recent: Option<usize>) -> Option<EnsembleStats> {
        let state = self.lock();
        if state.operations.is_empty() {
            return None;
        }
        let skip = recent
            .map(|n| state.operations.len().saturating_sub(n))
            .unwrap_or(0);
        let ops: Vec<&EnsembleOutcome> = state.operations.iter().skip(skip).collect();
        let total = ops.len();

        let refined = ops.iter().filter(|op| op.refined).count();
        let completed = ops.iter().filter(|op| op.completed).count();
        let successful = ops.iter().filter(|op| op.successful).count();
        let mut durations: Vec<f64> = ops.iter().map(|op| op.duration.as_secs_f64()).collect();
        durations.sort_by(f64::total_cmp);

        Some(EnsembleStats {
            total_operations: total,
            completed_operations: completed,
            successful_operations: successful,
            refined_operations: refined,
            operation_success_rate: successful as f64 / total as f64,
            average_model_success_rate: ops.iter().map(|op| op.success_rate()).sum::<f64>()
                / total as f64,
            average_duration_secs: durations.iter().sum::<f64>() / total as f64,
            min_duration_secs: durations.first().copied().unwrap_or(0.0),
            max_duration_secs: durations.last().copied().unwrap_or(0.0),
            p95_duration_secs: percentile(&durations, 95.0),
            p99_duration_secs: percentile(&durations, 99.0),
        })
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.operations.clear();
        state.backends.clear();
        self.errors.reset();
        tracing::info!("Performance metrics reset");
    }
}

fn derive_backend_stats(acc: &BackendAccumulator) -> BackendStats {
    let mut latencies: Vec<f64> = acc.recent_latencies.iter().map(Duration::as_secs_f64).collect();
    latencies.sort_by(f64::total_cmp);

    let average_latency_secs = if acc.successes > 0 {
        acc.success_latency.as_secs_f64() / acc.successes as f64
    } else {
        0.0
    };
    let success_rate = if acc.total > 0 {
        acc.successes as f64 / acc.total as f64
    } else {
        0.0
    };

    BackendStats {
        total_requests: acc.total,
        successful_requests: acc.successes,
        failed_requests: acc.failures,
        success_rate,
        average_latency_secs,
        p95_latency_secs: percentile(&latencies, 95.0),
        p99_latency_secs: percentile(&latencies, 99.0),
        error_counts: acc.errors.clone(),
    }
}

/// Nearest-rank percentile over ascending `sorted`: `sorted[min(⌊p/100·n⌋, n-1)]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(percentile(&values, 95.0), 10.0);
        assert_eq!(percentile(&values, 50.0), 6.0);
        assert_eq!(percentile(&[], 99.0), 0.0);
        assert_eq!(percentile(&[3.0], 99.0), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_stats() {
        let monitor = PerformanceMonitor::new(10, 100);

        let tracker = monitor.start_request("a");
        tokio::time::advance(Duration::from_secs(2)).await;
        monitor.finish_request(tracker, Ok(42), 1);

        let tracker = monitor.start_request("a");
        tokio::time::advance(Duration::from_secs(4)).await;
        monitor.finish_request(tracker, Ok(10), 2);

        let tracker = monitor.start_request("a");
        monitor.finish_request(tracker, Err(FailureKind::Timeout), 3);

        let stats = monitor.backend_stats("a").unwrap();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.average_latency_secs - 3.0).abs() < 1e-9);
        assert_eq!(stats.p99_latency_secs, 4.0);
        assert_eq!(stats.error_counts.get("timeout"), Some(&1));
        assert!(monitor.backend_stats("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_window_is_bounded() {
        let monitor = PerformanceMonitor::new(10, 2);
        for secs in [10, 1, 1] {
            let tracker = monitor.start_request("a");
            tokio::time::advance(Duration::from_secs(secs)).await;
            monitor.finish_request(tracker, Ok(1), 1);
        }
        let stats = monitor.backend_stats("a").unwrap();
        assert_eq!(stats.p99_latency_secs, 1.0);
        assert!((stats.average_latency_secs - 4.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensemble_stats_and_history_bound() {
        let monitor = PerformanceMonitor::new(3, 100);
        assert!(monitor.ensemble_stats(None).is_none());

        for refined in [false, true, true, true] {
            let completion = RunCompletion::Answered {
                refined,
                fallback: false,
                output_len: 20,
            };
            let mut ensemble = monitor.start_ensemble(12);
            let ok = monitor.start_request("a");
            ensemble.add_request(monitor.finish_request(ok, Ok(5), 1));
            let bad = monitor.start_request("b");
            ensemble.add_request(monitor.finish_request(bad, Err(FailureKind::Backend), 1));
            tokio::time::advance(Duration::from_secs(1)).await;
            let outcome = monitor.finish_ensemble(ensemble, completion);
            assert_eq!(outcome.backends_attempted, 2);
            assert_eq!(outcome.backends_succeeded, 1);
        }

        let stats = monitor.ensemble_stats(None).unwrap();
        assert_eq!(stats.total_operations, 3);
        assert_eq!(stats.refined_operations, 3);
        assert_eq!(stats.operation_success_rate, 1.0);
        assert!((stats.average_model_success_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.max_duration_secs, 1.0);

        let recent = monitor.ensemble_stats(Some(1)).unwrap();
        assert_eq!(recent.total_operations, 1);

        monitor.reset();
        assert!(monitor.ensemble_stats(None).is_none());
        assert!(monitor.all_backend_stats().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_not_completed() {
        let monitor = PerformanceMonitor::default();
        let ensemble = monitor.start_ensemble(5);
        let outcome = monitor.finish_ensemble(ensemble, RunCompletion::Failed);
        assert!(!outcome.completed);
        assert!(!outcome.successful);
        assert_eq!(outcome.success_rate(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefined_runs_count_as_successful() {
        let monitor = PerformanceMonitor::default();
        for _ in 0..3 {
            let ensemble = monitor.start_ensemble(5);
            let completion = RunCompletion::Answered {
                refined: false,
                fallback: false,
                output_len: 7,
            };
            assert!(monitor.finish_ensemble(ensemble, completion).successful);
        }

        let stats = monitor.ensemble_stats(None).unwrap();
        assert_eq!(stats.refined_operations, 0);
        assert_eq!(stats.successful_operations, 3);
        assert_eq!(stats.operation_success_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_run_is_completed_but_unsuccessful() {
        let monitor = PerformanceMonitor::default();
        let ensemble = monitor.start_ensemble(5);
        let completion = RunCompletion::Answered {
            refined: false,
            fallback: true,
            output_len: 40,
        };
        let outcome = monitor.finish_ensemble(ensemble, completion);
        assert!(outcome.completed);
        assert!(outcome.fallback);
        assert!(!outcome.successful);

        let stats = monitor.ensemble_stats(None).unwrap();
        assert_eq!(stats.completed_operations, 1);
        assert_eq!(stats.operation_success_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_carry_wall_clock_timestamps() {
        let monitor = PerformanceMonitor::default();
        let before = SystemTime::now();
        let mut ensemble = monitor.start_ensemble(5);

        let request = monitor.start_request("a");
        tokio::time::advance(Duration::from_secs(3)).await;
        let outcome = monitor.finish_request(request, Ok(1), 1);
        assert!(outcome.started_at >= before);
        assert_eq!(
            outcome.finished_at.duration_since(outcome.started_at).unwrap(),
            outcome.duration
        );
        ensemble.add_request(outcome);

        let run = monitor.finish_ensemble(ensemble, RunCompletion::Failed);
        assert!(run.started_at >= before);
        assert!(run.finished_at >= run.started_at);
        assert_eq!(run.finished_at.duration_since(run.started_at).unwrap(), run.duration);
    }

    #[test]
    fn test_failures_reach_error_tracker() {
        let monitor = PerformanceMonitor::default();
        monitor.record_failure("a", &BackendFailure::new(FailureKind::Timeout, "request timeout"));
        assert_eq!(monitor.errors().stats(Duration::from_secs(60)).total_errors, 1);
        monitor.reset();
        assert_eq!(monitor.errors().stats(Duration::from_secs(60)).total_errors, 0);
    }
}
