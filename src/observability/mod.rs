//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, stdout or log file)
//!     → metrics.rs (scan counters and durations via ScanReporter)
//!
//! Consumers:
//!     → Log file / stdout
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Components receive a reporter handle, not a global
//! - Metric updates go through the `metrics` facade and cost nothing when
//!   no exporter is installed

pub mod logging;
pub mod metrics;

pub use self::metrics::{MetricsReporter, ScanReport, ScanReporter, UnitReport};
