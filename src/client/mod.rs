//! Chat-completion client subsystem.
//!
//! # Data Flow
//! ```text
//! RequestDriver
//!     → ChatClient::complete(backend, prompt)
//!     → openrouter.rs (OpenAI-compatible HTTP API)
//!     → response text or ClientError
//! ```
//!
//! # Design Decisions
//! - The trait is object-safe and `Send + Sync`; one client is shared by all
//!   concurrent fan-out calls
//! - Errors carry only a message; retryability is decided by the driver
//!   from that message

pub mod openrouter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use openrouter::OpenRouterClient;

/// A prompt as sent to a backend: optional system instruction plus user text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPrompt {
    pub system: Option<String>,
    pub user: String,
}

impl ChatPrompt {
    /// A prompt consisting of user text only.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            system: None,
            user: text.into(),
        }
    }

    /// Attach a system instruction.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Total characters across both parts.
    pub fn len(&self) -> usize {
        self.system.as_ref().map_or(0, String::len) + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors reported by a chat-completion backend.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("no API key configured")]
    MissingApiKey,

    #[error("{0}")]
    Other(String),
}

/// The external chat-completion collaborator.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send `prompt` to `backend` and return the response text.
    async fn complete(&self, backend: &str, prompt: &ChatPrompt) -> Result<String, ClientError>;
}
