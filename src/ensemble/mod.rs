//! Ensemble subsystem.
//!
//! # Data Flow
//! ```text
//! Caller prompt:
//!     → orchestrator.rs (sanitize, correlation span, deadline)
//!     → fanout.rs (one RequestDriver call per backend, joined)
//!     → refine.rs (synthesis call, degradation ladder)
//!     → EnsembleAnswer or EnsembleError
//! ```
//!
//! # Design Decisions
//! - Backend failures travel in-band as `BackendResponse` values
//! - Only zero usable answers, bad input, or cancellation fail a run
//! - Refinement improves quality; its failure degrades, never aborts

pub mod error;
pub mod fanout;
pub mod orchestrator;
pub mod refine;
pub mod types;

pub use error::{EnsembleError, Stage};
pub use fanout::FanoutCoordinator;
pub use orchestrator::Orchestrator;
pub use refine::{build_synthesis_prompt, concatenate, Refiner, SYNTHESIS_INSTRUCTIONS};
pub use types::{BackendAnswer, EnsembleAnswer, FanoutResult, Refined, Strategy};
