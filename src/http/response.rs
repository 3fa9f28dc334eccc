//! Response bodies and error mapping.
//!
//! # Responsibilities
//! - Shape successful ensemble runs as JSON
//! - Map ensemble failures to HTTP status codes
//!
//! # Design Decisions
//! - Bad input and missing backends are client errors (400)
//! - Backend-side failures are gateway errors (502), deadlines 504
//! - Cancellation during shutdown is 503

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::ensemble::{EnsembleAnswer, EnsembleError, Strategy};

/// Body of a successful `POST /generate`.
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub correlation_id: String,
    pub models: Vec<String>,
    /// One entry per model, aligned with `models`; failures carry the `Error:` marker.
    pub individual_responses: Vec<String>,
    pub refined_answer: String,
    pub refinement_model: String,
    pub strategy: Strategy,
    pub degraded: bool,
}

impl From<&EnsembleAnswer> for GenerateResponse {
    fn from(answer: &EnsembleAnswer) -> Self {
        Self {
            correlation_id: answer.correlation_id.clone(),
            models: answer.responses.iter().map(|r| r.backend.clone()).collect(),
            individual_responses: answer.responses.iter().map(|r| r.display_text()).collect(),
            refined_answer: answer.text.clone(),
            refinement_model: answer.refinement_backend.clone(),
            strategy: answer.strategy,
            degraded: answer.degraded,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    stage: &'static str,
}

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub struct ApiError(pub EnsembleError);

impl From<EnsembleError> for ApiError {
    fn from(error: EnsembleError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EnsembleError::Sanitization(_)
            | EnsembleError::NoBackends
            | EnsembleError::Configuration(_) => StatusCode::BAD_REQUEST,
            EnsembleError::AllBackendsFailed { .. } | EnsembleError::NoValidResponses => {
                StatusCode::BAD_GATEWAY
            }
            EnsembleError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            EnsembleError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.0.to_string(),
            stage: self.0.stage().as_str(),
        };
        tracing::warn!(status = status.as_u16(), stage = body.stage, error = %body.error, "Request failed");
        (status, Json(body)).into_response()
    }
}
