//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the ensemble.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the ensemble.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Backend model identifiers queried in parallel.
    pub models: Vec<String>,

    /// Model used to synthesize the final answer.
    /// Falls back to the first entry of `models` when unset.
    pub refinement_model: Option<String>,

    /// Chat-completion API settings.
    pub api: ApiConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Per-backend rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Per-backend circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Refinement and degradation settings.
    pub refinement: RefinementConfig,

    /// Prompt sanitization limits.
    pub prompt: PromptConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// HTTP server settings.
    pub server: ServerConfig,

    /// Where finished answers are written.
    pub output: OutputConfig,
}

impl EnsembleConfig {
    /// The refinement model, defaulting to the first configured model.
    pub fn refinement_model(&self) -> Option<&str> {
        self.refinement_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| self.models.first().map(String::as_str))
    }
}

/// Chat-completion endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,

    /// API key. Usually supplied through the environment instead.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Environment variable consulted for the API key.
    pub api_key_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            api_key_env: "OPENROUTER_API_KEY".to_string(),
        }
    }
}

/// Timeout configuration for backend calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Nominal per-request timeout in seconds.
    pub request_secs: u64,

    /// Slack added on top of the nominal timeout so we never race the
    /// backend's own deadline.
    pub buffer_secs: u64,

    /// Refinement calls get `request_secs * refinement_multiplier`.
    pub refinement_multiplier: f64,

    /// Optional deadline for a whole ensemble run.
    pub ensemble_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn buffer(&self) -> Duration {
        Duration::from_secs(self.buffer_secs)
    }

    /// Saturates at `Duration::MAX` for multipliers too large to represent.
    pub fn refinement(&self) -> Duration {
        let secs = self.request().as_secs_f64() * self.refinement_multiplier.max(1.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn ensemble(&self) -> Option<Duration> {
        self.ensemble_secs.map(Duration::from_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 60,
            buffer_secs: 5,
            refinement_multiplier: 2.0,
            ensemble_secs: None,
        }
    }
}

/// Rate limiting configuration, applied independently per backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum requests in any trailing 60 second window.
    pub requests_per_minute: u32,

    /// Maximum requests in any trailing 1 second window.
    pub requests_per_second: u32,

    /// Maximum requests in any trailing 100 ms window.
    pub burst_limit: u32,

    /// Punitive backoff is `backoff_multiplier ^ consecutive_failures` seconds.
    pub backoff_multiplier: f64,

    /// Upper bound on punitive backoff in seconds.
    pub max_backoff_secs: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_second: 5,
            burst_limit: 10,
            backoff_multiplier: 2.0,
            max_backoff_secs: 60.0,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per backend call (including the first).
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on any single retry delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Random jitter added to each delay, as a fraction of it.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.0,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Seconds spent Open before a trial request is let through.
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

/// Refinement and degradation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Still call the refinement model when only one backend answered.
    pub refine_single_response: bool,

    /// Fan-out success ratio below which a batch is flagged as degraded.
    pub min_success_ratio: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            refine_single_response: false,
            min_success_ratio: 0.5,
        }
    }
}

/// Prompt sanitization limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Maximum prompt length after sanitization.
    pub max_length: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self { max_length: 10_000 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,

    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,

    /// Ensemble operations kept for statistics.
    pub max_history: usize,

    /// Recent latencies kept per backend for percentiles.
    pub latency_window: usize,

    /// Seconds between background health evaluations in server mode; 0 disables.
    pub health_interval_secs: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            max_history: 1000,
            latency_window: 100,
            health_interval_secs: 30,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:5000").
    pub bind_address: String,

    /// Upper bound on a single HTTP request, in seconds.
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5000".to_string(),
            request_timeout_secs: 300,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Output persistence configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory that receives one markdown file per run.
    pub directory: Option<PathBuf>,
}
