//! Ensemble result types.

use serde::Serialize;

use crate::observability::RequestOutcome;
use crate::resilience::BackendResponse;

/// One backend's answer, paired with its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendAnswer {
    pub backend: String,
    pub response: BackendResponse,
}

impl BackendAnswer {
    pub fn new(backend: impl Into<String>, response: BackendResponse) -> Self {
        Self {
            backend: backend.into(),
            response,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.response.is_ok()
    }

    /// The answer text, if the backend succeeded.
    pub fn text(&self) -> Option<&str> {
        self.response.as_deref().ok()
    }

    /// Text for display: the answer, or the failure rendered with its `Error:` marker.
    pub fn display_text(&self) -> String {
        match &self.response {
            Ok(text) => text.clone(),
            Err(failure) => failure.to_string(),
        }
    }
}

/// How the final answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// The refinement backend synthesized the valid answers.
    Synthesized,
    /// A single valid answer was returned unchanged.
    SingleResponse,
    /// Refinement failed; the valid answers were concatenated.
    Concatenated,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synthesized => "synthesized",
            Self::SingleResponse => "single_response",
            Self::Concatenated => "concatenated",
        }
    }
}

/// Per-backend results of one fan-out, in input order.
#[derive(Debug, Clone)]
pub struct FanoutResult {
    pub answers: Vec<BackendAnswer>,
    pub outcomes: Vec<RequestOutcome>,
    pub success_count: usize,
    /// Fewer backends than the configured ratio answered.
    pub degraded: bool,
}

impl FanoutResult {
    pub fn success_ratio(&self) -> f64 {
        if self.answers.is_empty() {
            0.0
        } else {
            self.success_count as f64 / self.answers.len() as f64
        }
    }
}

/// Final answer of the refinement stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Refined {
    pub text: String,
    pub strategy: Strategy,
    /// Refinement was attempted and failed.
    pub fallback: bool,
}

/// Result of a complete ensemble run.
#[derive(Debug, Clone)]
pub struct EnsembleAnswer {
    pub correlation_id: String,
    /// Sanitized prompt sent to the backends.
    pub prompt: String,
    pub text: String,
    pub strategy: Strategy,
    pub refinement_backend: String,
    /// Per-backend answers, in input order.
    pub responses: Vec<BackendAnswer>,
    /// Fan-out fell below the success ratio or refinement did not run.
    pub degraded: bool,
}

impl EnsembleAnswer {
    pub fn backends(&self) -> Vec<&str> {
        self.responses.iter().map(|r| r.backend.as_str()).collect()
    }
}
