//! Health evaluation.
//!
//! # Checks
//! - configuration: models, refinement model and API key present
//! - backends: circuit breaker states of the configured models
//! - performance: backend success rate and latency, ensemble success rate
//! - errors: alert conditions over recent backend failures
//! - output: the result directory can be created and written
//! - validation: the prompt sanitizer handles known inputs
//!
//! # Design Decisions
//! - No backend is called; the output check writes one small file
//! - Overall status is the worst individual status

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;

use crate::ensemble::Orchestrator;
use crate::observability::errors::ALERT_WINDOW;
use crate::resilience::CircuitState;
use crate::security::{sanitize_prompt, PromptError};

/// Backend success rate below which performance is degraded.
const MIN_BACKEND_SUCCESS_RATE: f64 = 0.8;
/// Average backend latency above which performance is degraded.
const MAX_AVERAGE_LATENCY_SECS: f64 = 30.0;
/// Ensemble operation success rate below which performance is degraded.
const MIN_OPERATION_SUCCESS_RATE: f64 = 0.9;
/// Runs considered for the ensemble success rate.
const RECENT_OPERATIONS: usize = 100;
/// File written and removed by the output check.
const OUTPUT_TEST_FILE: &str = ".health_check";

/// Health status levels, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Result of one named check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub message: String,
    pub details: serde_json::Value,
}

impl CheckResult {
    fn new(status: HealthStatus, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status,
            message: message.into(),
            details,
        }
    }
}

/// Aggregated health of the service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub issues: Vec<String>,
    pub checks: BTreeMap<&'static str, CheckResult>,
}

/// Evaluates health from orchestrator state.
#[derive(Clone)]
pub struct HealthChecker {
    orchestrator: Arc<Orchestrator>,
}

impl HealthChecker {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn check(&self) -> HealthReport {
        let mut issues = Vec::new();
        let mut checks = BTreeMap::new();
        checks.insert("configuration", self.check_configuration(&mut issues));
        checks.insert("backends", self.check_backends(&mut issues));
        checks.insert("performance", self.check_performance(&mut issues));
        checks.insert("errors", self.check_errors(&mut issues));
        checks.insert("output", self.check_output(&mut issues));
        checks.insert("validation", self.check_validation(&mut issues));

        let status = checks
            .values()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            status,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            issues,
            checks,
        }
    }

    fn check_configuration(&self, issues: &mut Vec<String>) -> CheckResult {
        let config = self.orchestrator.config();
        let details = json!({
            "models": config.models.len(),
            "refinement_model": config.refinement_model(),
            "api_key_configured": config.api.api_key.is_some(),
        });

        let (status, message) = if config.models.is_empty() {
            (HealthStatus::Unhealthy, "No models configured")
        } else if config.refinement_model().is_none() {
            (HealthStatus::Unhealthy, "No refinement model configured")
        } else if config.api.api_key.is_none() {
            (HealthStatus::Degraded, "API key not configured")
        } else {
            (HealthStatus::Healthy, "Configuration is valid")
        };
        if status != HealthStatus::Healthy {
            issues.push(message.to_string());
        }
        CheckResult::new(status, message, details)
    }

    fn check_backends(&self, issues: &mut Vec<String>) -> CheckResult {
        let config = self.orchestrator.config();
        let circuits = self.orchestrator.circuit_snapshot();
        let limits = self.orchestrator.rate_limit_stats();

        let open: Vec<&str> = config
            .models
            .iter()
            .filter(|model| {
                circuits
                    .get(model.as_str())
                    .is_some_and(|c| c.state == CircuitState::Open)
            })
            .map(String::as_str)
            .collect();

        for model in &open {
            issues.push(format!("Circuit open for backend {model}"));
        }

        let status = if !config.models.is_empty() && open.len() == config.models.len() {
            HealthStatus::Unhealthy
        } else if !open.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let message = match status {
            HealthStatus::Healthy => "All backend circuits closed".to_string(),
            _ => format!("{} of {} backend circuits open", open.len(), config.models.len()),
        };

        CheckResult::new(
            status,
            message,
            json!({ "circuits": circuits, "rate_limits": limits }),
        )
    }

    fn check_performance(&self, issues: &mut Vec<String>) -> CheckResult {
        let monitor = self.orchestrator.monitor();
        let backends = monitor.all_backend_stats();
        let ensemble = monitor.ensemble_stats(Some(RECENT_OPERATIONS));
        let mut found = Vec::new();

        for (backend, stats) in &backends {
            if stats.success_rate < MIN_BACKEND_SUCCESS_RATE {
                found.push(format!(
                    "Backend {backend} has low success rate: {:.0}%",
                    stats.success_rate * 100.0
                ));
            }
            if stats.average_latency_secs > MAX_AVERAGE_LATENCY_SECS {
                found.push(format!(
                    "Backend {backend} has high latency: {:.2}s",
                    stats.average_latency_secs
                ));
            }
        }
        if let Some(stats) = &ensemble {
            if stats.operation_success_rate < MIN_OPERATION_SUCCESS_RATE {
                found.push(format!(
                    "Low ensemble success rate: {:.0}%",
                    stats.operation_success_rate * 100.0
                ));
            }
        }

        let (status, message) = if found.is_empty() {
            (HealthStatus::Healthy, "Performance metrics are healthy".to_string())
        } else {
            (
                HealthStatus::Degraded,
                format!("Performance issues detected: {}", found.join(", ")),
            )
        };
        issues.extend(found);

        CheckResult::new(
            status,
            message,
            json!({ "backends": backends, "ensemble": ensemble }),
        )
    }

    fn check_errors(&self, issues: &mut Vec<String>) -> CheckResult {
        let errors = self.orchestrator.monitor().errors();
        let alerts = errors.alerts();
        let stats = errors.stats(ALERT_WINDOW);

        let (status, message) = if alerts.is_empty() {
            (HealthStatus::Healthy, "No error alerts".to_string())
        } else {
            let messages: Vec<&str> = alerts.iter().map(|a| a.message.as_str()).collect();
            (
                HealthStatus::Degraded,
                format!("Error alerts: {}", messages.join(", ")),
            )
        };
        issues.extend(alerts.iter().map(|a| a.message.clone()));

        CheckResult::new(status, message, json!({ "alerts": alerts, "recent": stats }))
    }

    fn check_output(&self, issues: &mut Vec<String>) -> CheckResult {
        let config = self.orchestrator.config();
        let Some(directory) = config.output.directory.as_deref() else {
            return CheckResult::new(
                HealthStatus::Healthy,
                "Result persistence disabled",
                json!({ "directory": null }),
            );
        };

        let details = json!({ "directory": directory.display().to_string() });
        let (status, message) = match write_test_file(directory) {
            Ok(()) => (HealthStatus::Healthy, "Output directory is writable".to_string()),
            Err(OutputFault::NotWritable(e)) => (
                HealthStatus::Degraded,
                format!("Output directory is not writable: {e}"),
            ),
            Err(OutputFault::Unusable(e)) => (
                HealthStatus::Unhealthy,
                format!("Output directory check failed: {e}"),
            ),
        };
        if status != HealthStatus::Healthy {
            issues.push(message.clone());
        }
        CheckResult::new(status, message, details)
    }

    fn check_validation(&self, issues: &mut Vec<String>) -> CheckResult {
        let max_length = self.orchestrator.config().prompt.max_length;
        let (status, message) = match exercise_sanitizer(max_length) {
            Ok(()) => (HealthStatus::Healthy, "Prompt validation is working".to_string()),
            Err(problem) => {
                let message = format!("Prompt validation warning: {problem}");
                issues.push(message.clone());
                (HealthStatus::Degraded, message)
            }
        };
        CheckResult::new(
            status,
            message,
            json!({ "test_prompts": VALIDATION_PROMPTS.len() }),
        )
    }
}

enum OutputFault {
    NotWritable(io::Error),
    Unusable(io::Error),
}

/// Create `directory` if needed, then write and remove a test file in it.
fn write_test_file(directory: &Path) -> Result<(), OutputFault> {
    fs::create_dir_all(directory).map_err(OutputFault::Unusable)?;
    let path = directory.join(OUTPUT_TEST_FILE);
    fs::write(&path, b"health check").map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => OutputFault::NotWritable(e),
        _ => OutputFault::Unusable(e),
    })?;
    fs::remove_file(&path).map_err(OutputFault::Unusable)
}

const VALIDATION_PROMPTS: [&str; 4] = [
    "Normal prompt",
    "<script>alert('test')</script>Dangerous prompt",
    "   Prompt with   excessive   whitespace   ",
    "A long prompt that repeats. ",
];

/// Run the sanitizer over known prompts and compare with the expected handling.
fn exercise_sanitizer(max_length: usize) -> Result<(), String> {
    let [normal, script, spaced, long] = VALIDATION_PROMPTS;

    match sanitize_prompt(normal, max_length) {
        Ok(clean) if clean == normal => {}
        other => return Err(format!("plain prompt changed: {other:?}")),
    }
    match sanitize_prompt(script, max_length) {
        Err(PromptError::DangerousContent) => {}
        Ok(clean) if !clean.to_lowercase().contains("<script") => {}
        other => return Err(format!("script markup not removed: {other:?}")),
    }
    match sanitize_prompt(spaced, max_length) {
        Ok(clean) if clean == "Prompt with excessive whitespace" => {}
        other => return Err(format!("whitespace not collapsed: {other:?}")),
    }
    let long = long.repeat(max_length / long.len() + 2);
    match sanitize_prompt(&long, max_length) {
        Ok(clean) if !clean.is_empty() && clean.chars().count() <= max_length + 3 => {}
        other => return Err(format!("long prompt not truncated: {other:?}")),
    }
    Ok(())
}
