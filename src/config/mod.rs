//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize, overlay environment)
//!     → validation.rs (semantic checks)
//!     → EnsembleConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change (server mode):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of the orchestrator's live config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Environment variables win over the file
//! - Rate limiter and breaker tuning is fixed at startup

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ApiConfig, CircuitBreakerConfig, EnsembleConfig, LogFormat, ObservabilityConfig,
    OutputConfig, PromptConfig, RateLimitConfig, RefinementConfig, RetryConfig, ServerConfig,
    TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
