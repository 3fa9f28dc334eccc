//! Resilient multi-backend LLM ensemble.
//!
//! One prompt is fanned out to several chat-completion backends; their
//! answers are synthesized into one by a refinement backend. The library
//! provides the orchestration layer: per-backend rate limiting and circuit
//! breaking, bounded retries, concurrent fan-out and a degradation ladder.

// Core
pub mod client;
pub mod config;
pub mod ensemble;
pub mod resilience;

// Front ends
pub mod http;
pub mod output;

// Cross-cutting concerns
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use client::{ChatClient, ChatPrompt, ClientError, OpenRouterClient};
pub use config::EnsembleConfig;
pub use ensemble::{EnsembleAnswer, EnsembleError, Orchestrator, Strategy};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
