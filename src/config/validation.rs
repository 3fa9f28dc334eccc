//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate model identifiers
//! - Validate value ranges (timeouts > 0, limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EnsembleConfig → Result<(), Vec<ValidationError>>
//! - A missing API key is only a warning; health checks report it

use thiserror::Error;
use url::Url;

use crate::config::schema::EnsembleConfig;

const MAX_MODEL_NAME_LEN: usize = 100;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no models configured")]
    NoModels,

    #[error("model name is empty")]
    EmptyModelName,

    #[error("model name too long: {0}")]
    ModelNameTooLong(String),

    #[error("invalid characters in model name: {0}")]
    InvalidModelName(String),

    #[error("invalid refinement model: {0}")]
    InvalidRefinementModel(String),

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("{field} must be a finite number, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} must be between 0 and 1, got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("invalid API base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Check a single backend identifier.
pub fn validate_model_name(name: &str) -> Result<(), ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyModelName);
    }
    if name.len() > MAX_MODEL_NAME_LEN {
        return Err(ValidationError::ModelNameTooLong(name.to_string()));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | ':');
    if !name.chars().all(allowed) {
        return Err(ValidationError::InvalidModelName(name.to_string()));
    }
    Ok(())
}

/// Validate a configuration, collecting every violation.
pub fn validate_config(config: &EnsembleConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.models.is_empty() {
        errors.push(ValidationError::NoModels);
    }
    for model in &config.models {
        if let Err(e) = validate_model_name(model) {
            errors.push(e);
        }
    }
    if let Some(refinement) = &config.refinement_model {
        if validate_model_name(refinement).is_err() {
            errors.push(ValidationError::InvalidRefinementModel(refinement.clone()));
        }
    }

    let floats: [(&'static str, f64); 3] = [
        ("timeouts.refinement_multiplier", config.timeouts.refinement_multiplier),
        ("rate_limit.backoff_multiplier", config.rate_limit.backoff_multiplier),
        ("rate_limit.max_backoff_secs", config.rate_limit.max_backoff_secs),
    ];
    for (field, value) in floats {
        if !value.is_finite() {
            errors.push(ValidationError::NotFinite { field, value });
        } else if value <= 0.0 {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    let positive: [(&'static str, bool); 8] = [
        ("timeouts.request_secs", config.timeouts.request_secs > 0),
        ("rate_limit.requests_per_minute", config.rate_limit.requests_per_minute > 0),
        ("rate_limit.requests_per_second", config.rate_limit.requests_per_second > 0),
        ("rate_limit.burst_limit", config.rate_limit.burst_limit > 0),
        ("retries.max_attempts", config.retries.max_attempts > 0),
        ("circuit_breaker.failure_threshold", config.circuit_breaker.failure_threshold > 0),
        ("prompt.max_length", config.prompt.max_length > 0),
        ("observability.latency_window", config.observability.latency_window > 0),
    ];
    errors.extend(
        positive
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(field, _)| ValidationError::NotPositive { field }),
    );

    let ratio = config.refinement.min_success_ratio;
    if !(0.0..=1.0).contains(&ratio) {
        errors.push(ValidationError::OutOfRange {
            field: "refinement.min_success_ratio",
            value: ratio,
        });
    }
    let jitter = config.retries.jitter_ratio;
    if !(0.0..=1.0).contains(&jitter) {
        errors.push(ValidationError::OutOfRange {
            field: "retries.jitter_ratio",
            value: jitter,
        });
    }

    if let Err(e) = Url::parse(&config.api.base_url) {
        errors.push(ValidationError::InvalidBaseUrl {
            url: config.api.base_url.clone(),
            reason: e.to_string(),
        });
    }

    if config.api.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
        tracing::warn!(env = %config.api.api_key_env, "API key not set, backend calls will fail");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
