//! Terminal ensemble failures.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::security::PromptError;

/// Where in the pipeline a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configuration,
    Input,
    Fanout,
    Refinement,
    Caller,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Input => "input",
            Self::Fanout => "fan-out",
            Self::Refinement => "refinement",
            Self::Caller => "caller",
        }
    }
}

/// Hard failure of an ensemble run. Recoverable conditions (partial backend
/// failure, refinement failure) never surface here.
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("no backends configured")]
    NoBackends,

    #[error("invalid prompt: {0}")]
    Sanitization(#[from] PromptError),

    #[error("all {attempted} backends failed")]
    AllBackendsFailed { attempted: usize },

    #[error("no valid responses available for refinement")]
    NoValidResponses,

    #[error("ensemble run cancelled")]
    Cancelled,

    #[error("ensemble run exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EnsembleError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::NoBackends | Self::Configuration(_) => Stage::Configuration,
            Self::Sanitization(_) => Stage::Input,
            Self::AllBackendsFailed { .. } => Stage::Fanout,
            Self::NoValidResponses => Stage::Refinement,
            Self::Cancelled | Self::DeadlineExceeded(_) => Stage::Caller,
        }
    }
}
