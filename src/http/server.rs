//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, timeout, body limit, request ID)
//! - Bind server to listener with graceful shutdown
//!
//! # Routes
//! - `POST /generate`: run an ensemble
//! - `GET /health`: health report, 503 when unhealthy
//! - `GET /stats`: monitor, error, rate limiter and circuit breaker statistics
//! - `GET /metrics`: Prometheus exposition, 404 when disabled

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::ensemble::Orchestrator;
use crate::health::{HealthChecker, HealthStatus};
use crate::http::response::{ApiError, GenerateResponse};
use crate::output::write_answer;

pub const X_REQUEST_ID: &str = "x-request-id";

const ERROR_STATS_WINDOW: Duration = Duration::from_secs(60 * 60);
const RECENT_ERRORS: usize = 20;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub health: HealthChecker,
    pub metrics: Option<PrometheusHandle>,
    /// Parent of every run's cancellation token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            health: HealthChecker::new(orchestrator.clone()),
            orchestrator,
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }
}

/// HTTP front end for the orchestrator.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(config: &ServerConfig, state: AppState) -> Self {
        Self {
            router: Self::build_router(config, state),
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    pub fn build_router(config: &ServerConfig, state: AppState) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            }))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
            .layer(TimeoutLayer::new(Duration::from_secs(config.request_timeout_secs)));

        Router::new()
            .route("/generate", post(generate_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(middleware)
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    models: Option<Vec<String>>,
    #[serde(default)]
    refinement_model: Option<String>,
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let config = state.orchestrator.config();
    let models = request
        .models
        .filter(|models| !models.is_empty())
        .unwrap_or_else(|| config.models.clone());
    let refinement = request
        .refinement_model
        .filter(|model| !model.trim().is_empty())
        .or_else(|| config.refinement_model.clone().filter(|m| !m.trim().is_empty()))
        .or_else(|| models.first().cloned())
        .unwrap_or_default();

    let answer = state
        .orchestrator
        .run_ensemble_with_cancel(&request.prompt, &models, &refinement, state.shutdown.child_token())
        .await?;

    if let Some(directory) = config.output.directory.clone() {
        persist(directory, answer.clone());
    }

    Ok(Json(GenerateResponse::from(&answer)))
}

fn persist(directory: PathBuf, answer: crate::ensemble::EnsembleAnswer) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = write_answer(&directory, &answer) {
            tracing::error!(error = %e, directory = %directory.display(), "Failed to write ensemble result");
        }
    });
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.health.check();
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    let monitor = state.orchestrator.monitor();
    let errors = monitor.errors();
    Json(json!({
        "backends": monitor.all_backend_stats(),
        "ensemble": monitor.ensemble_stats(None),
        "errors": {
            "last_hour": errors.stats(ERROR_STATS_WINDOW),
            "alerts": errors.alerts(),
            "recent": errors.recent(RECENT_ERRORS),
        },
        "rate_limits": state.orchestrator.rate_limit_stats(),
        "circuits": state.orchestrator.circuit_snapshot(),
    }))
    .into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
