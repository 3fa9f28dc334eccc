//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming prompt:
//!     → sanitize.rs (reject injection vectors, strip markup, bound length)
//!     → Pass to the orchestrator
//!
//! Outgoing error text (logs, HTTP bodies):
//!     → redact.rs (mask keys, tokens, personal data)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any sanitization failure
//! - No trust in client input or in backend error bodies

pub mod redact;
pub mod sanitize;

pub use redact::redact;
pub use sanitize::{sanitize_prompt, PromptError};
