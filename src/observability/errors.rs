//! Windowed tracker of backend failures.
//!
//! # Data Flow
//! ```text
//! RequestDriver (failed or panicked call) → ErrorTracker::record
//! Readers: stats(window) for /stats, alerts() for the health check
//! ```
//!
//! # Design Decisions
//! - History is bounded; the oldest records are dropped first
//! - Windows are measured on the tokio clock, timestamps on the wall clock
//! - Cancelled calls and open circuits are not failures of a backend

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;

use crate::observability::metrics;
use crate::resilience::{BackendFailure, FailureKind};

/// Window the alert conditions are evaluated over.
pub const ALERT_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Failures per minute above which the rate alert fires.
pub const MAX_ERROR_RATE_PER_MINUTE: f64 = 10.0;
/// Authentication failures in the alert window above which the auth alert fires.
pub const MAX_AUTH_FAILURES: usize = 5;

/// Coarse grouping of a failure by its cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Api,
    Processing,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Api => "api",
            Self::Processing => "processing",
            Self::System => "system",
        }
    }

    /// Categorize a failure from its kind and, for backend errors, its text.
    pub fn of(failure: &BackendFailure) -> Self {
        match failure.kind {
            FailureKind::RateLimited => Self::RateLimit,
            FailureKind::Timeout | FailureKind::RetriesExhausted => Self::Network,
            FailureKind::EmptyResponse => Self::Processing,
            FailureKind::Panicked => Self::System,
            FailureKind::Backend if is_auth_message(&failure.message) => Self::Authentication,
            FailureKind::Backend if is_network_message(&failure.message) => Self::Network,
            FailureKind::Backend | FailureKind::CircuitOpen | FailureKind::Cancelled => Self::Api,
        }
    }
}

fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["401", "403", "unauthorized", "forbidden", "api key", "authentication"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn is_network_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["connection", "transport", "dns", "http error"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn of(kind: FailureKind, category: ErrorCategory) -> Self {
        match (kind, category) {
            (FailureKind::Panicked, _) => Self::Critical,
            (_, ErrorCategory::Authentication) => Self::High,
            (_, ErrorCategory::RateLimit) => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    #[serde(skip)]
    at: Instant,
    pub timestamp: SystemTime,
    pub backend: String,
    pub kind: FailureKind,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
}

/// Aggregates over the failures inside one window.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct ErrorStats {
    pub window_secs: u64,
    pub total_errors: usize,
    pub error_rate_per_minute: f64,
    pub by_kind: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
    pub by_backend: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    CriticalErrors,
    AuthenticationFailures,
}

/// A condition over recent failures that needs attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
}

/// Bounded, windowed history of backend failures.
#[derive(Debug)]
pub struct ErrorTracker {
    max_history: usize,
    records: Mutex<VecDeque<ErrorRecord>>,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ErrorTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ErrorRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failed call. Cancellations are ignored.
    pub fn record(&self, backend: &str, failure: &BackendFailure) {
        if failure.kind == FailureKind::Cancelled {
            return;
        }
        let category = ErrorCategory::of(failure);
        let severity = Severity::of(failure.kind, category);
        metrics::record_backend_error(backend, category.as_str(), severity.as_str());

        let mut records = self.lock();
        records.push_back(ErrorRecord {
            at: Instant::now(),
            timestamp: SystemTime::now(),
            backend: backend.to_string(),
            kind: failure.kind,
            category,
            severity,
            message: failure.message.clone(),
        });
        while records.len() > self.max_history {
            records.pop_front();
        }
    }

    /// Aggregates over failures recorded within the last `window`.
    pub fn stats(&self, window: Duration) -> ErrorStats {
        let records = self.lock();
        let recent: Vec<&ErrorRecord> = within(&records, window).collect();

        let mut stats = ErrorStats {
            window_secs: window.as_secs(),
            total_errors: recent.len(),
            error_rate_per_minute: recent.len() as f64 / (window.as_secs_f64() / 60.0).max(1.0),
            ..ErrorStats::default()
        };
        for record in recent {
            *stats.by_kind.entry(record.kind.as_str().to_string()).or_default() += 1;
            *stats.by_category.entry(record.category.as_str().to_string()).or_default() += 1;
            *stats.by_severity.entry(record.severity.as_str().to_string()).or_default() += 1;
            *stats.by_backend.entry(record.backend.clone()).or_default() += 1;
        }
        stats
    }

    /// The most recent `limit` failures, newest last.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    /// Alert conditions over the last [`ALERT_WINDOW`].
    pub fn alerts(&self) -> Vec<Alert> {
        let stats = self.stats(ALERT_WINDOW);
        let mut alerts = Vec::new();

        if stats.error_rate_per_minute > MAX_ERROR_RATE_PER_MINUTE {
            alerts.push(Alert {
                kind: AlertKind::HighErrorRate,
                severity: Severity::High,
                message: format!(
                    "High error rate: {:.1} errors/minute",
                    stats.error_rate_per_minute
                ),
            });
        }

        let critical = stats.by_severity.get(Severity::Critical.as_str()).copied().unwrap_or(0);
        if critical > 0 {
            alerts.push(Alert {
                kind: AlertKind::CriticalErrors,
                severity: Severity::Critical,
                message: format!("{critical} critical errors in last 5 minutes"),
            });
        }

        let auth = stats
            .by_category
            .get(ErrorCategory::Authentication.as_str())
            .copied()
            .unwrap_or(0);
        if auth > MAX_AUTH_FAILURES {
            alerts.push(Alert {
                kind: AlertKind::AuthenticationFailures,
                severity: Severity::High,
                message: format!("{auth} authentication failures in last 5 minutes"),
            });
        }

        alerts
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

fn within(records: &VecDeque<ErrorRecord>, window: Duration) -> impl Iterator<Item = &ErrorRecord> {
    let now = Instant::now();
    records
        .iter()
        .filter(move |record| now.saturating_duration_since(record.at) <= window)
}
