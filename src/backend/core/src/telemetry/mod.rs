//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing-subscriber` setup with JSON/pretty/compact output
//! - **Metrics**: names and helpers over the `metrics` facade

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, CommandMetrics, QueryMetrics};
