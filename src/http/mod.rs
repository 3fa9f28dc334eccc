//! HTTP front end.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, timeout, body limit, tracing)
//!     → handler (generate / health / stats / metrics)
//!     → Orchestrator or health checker
//!     → response.rs (JSON body, error → status mapping)
//!     → Send to client
//! ```

pub mod response;
pub mod server;

pub use response::{ApiError, GenerateResponse};
pub use server::{AppState, HttpServer, X_REQUEST_ID};
