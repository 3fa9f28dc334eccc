//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → tracing.rs (spans with correlation IDs)
//!
//! Request driver and orchestrator additionally feed:
//!     → monitor.rs (per-backend and per-run statistics)
//!     → errors.rs (windowed failure history and alerts)
//!
//! Consumers:
//!     → Log output (stderr, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Health checks and the /stats endpoint
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Correlation ID flows through every event of a run
//! - Metrics are cheap and disabled unless a recorder is installed

pub mod errors;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod tracing;

pub use errors::{Alert, AlertKind, ErrorCategory, ErrorStats, ErrorTracker, Severity};
pub use logging::init_logging;
pub use monitor::{
    BackendStats, EnsembleOutcome, EnsembleStats, EnsembleTracker, PerformanceMonitor,
    RequestOutcome, RequestTracker, RunCompletion,
};
