//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::EnsembleConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Request timeout used in production when none is configured explicitly.
const PRODUCTION_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from an optional TOML file plus the
/// process environment.
pub fn load_config(path: Option<&Path>) -> Result<EnsembleConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            let config: EnsembleConfig = toml::from_str(&content)?;
            tracing::info!(path = %path.display(), "Loaded configuration file");
            config
        }
        None => EnsembleConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Overlay environment variables on top of file configuration.
///
/// `lookup` abstracts the environment so callers (and tests) can supply
/// their own source.
pub fn apply_env_overrides<F>(config: &mut EnsembleConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(models) = non_empty("MODELS") {
        config.models = models
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .collect();
    }

    if let Some(model) = non_empty("REFINEMENT_MODEL_NAME") {
        config.refinement_model = Some(model.trim().to_string());
    }

    if let Some(key) = non_empty(&config.api.api_key_env) {
        config.api.api_key = Some(key.trim().to_string());
    }

    match non_empty("REQUEST_TIMEOUT") {
        Some(value) => config.timeouts.request_secs = parse_env("REQUEST_TIMEOUT", &value)?,
        None => {
            let production = non_empty("ENVIRONMENT")
                .is_some_and(|env| env.trim().eq_ignore_ascii_case("production"));
            if production {
                config.timeouts.request_secs = config
                    .timeouts
                    .request_secs
                    .min(PRODUCTION_REQUEST_TIMEOUT_SECS);
            }
        }
    }

    if let Some(value) = non_empty("RATE_LIMIT_PER_MINUTE") {
        config.rate_limit.requests_per_minute = parse_env("RATE_LIMIT_PER_MINUTE", &value)?;
    }

    if let Some(value) = non_empty("MAX_RETRIES") {
        config.retries.max_attempts = parse_env("MAX_RETRIES", &value)?;
    }

    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}
