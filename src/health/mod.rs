//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! On demand (checker.rs):
//!     GET /health or `ensemble-cli health`
//!     → configuration, backend circuit and performance checks
//!     → HealthReport (worst status wins)
//!
//! Periodic (reporter.rs):
//!     Timer tick
//!     → checker.rs
//!     → Log status transitions
//! ```
//!
//! # Design Decisions
//! - Health is derived from state the orchestrator already keeps
//! - No synthetic traffic against paid backends

pub mod checker;
pub mod reporter;

pub use checker::{CheckResult, HealthChecker, HealthReport, HealthStatus};
pub use reporter::HealthReporter;
