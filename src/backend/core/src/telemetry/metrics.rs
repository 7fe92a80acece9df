//! Metric names and recording helpers.
//!
//! The core only emits through the `metrics` facade macros; installing a
//! recorder (Prometheus or anything else) is left to the embedding process.
//! Without a recorder every call is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use confstore_core::telemetry::metrics::CommandMetrics;
//! use std::time::Instant;
//!
//! let started = Instant::now();
//! CommandMetrics::record("put", "ok", started.elapsed().as_secs_f64());
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};

pub const COMMANDS_TOTAL: &str = "confstore_commands_total";
pub const COMMAND_DURATION_SECONDS: &str = "confstore_command_duration_seconds";
pub const QUERIES_TOTAL: &str = "confstore_queries_total";
pub const CONFLICT_RETRIES_TOTAL: &str = "confstore_conflict_retries_total";
pub const PROJECTION_APPLIED_TOTAL: &str = "confstore_projection_applied_total";
pub const PROJECTION_REBUILDS_TOTAL: &str = "confstore_projection_rebuilds_total";
pub const PROJECTION_RESYNCS_TOTAL: &str = "confstore_projection_resyncs_total";
pub const AUDIT_PUBLISHED_TOTAL: &str = "confstore_audit_published_total";
pub const AUDIT_DROPPED_TOTAL: &str = "confstore_audit_dropped_total";
pub const ERRORS_TOTAL: &str = "confstore_errors_total";

/// Register descriptions for every metric the core emits with the current recorder.
///
/// [`ConfigService::from_config`](crate::service::ConfigService::from_config)
/// calls this, so a recorder installed before the service is built gets the
/// descriptions. Processes that install one later call it again themselves.
pub fn describe_metrics() {
    describe_counter!(COMMANDS_TOTAL, "Write commands by command and outcome");
    describe_histogram!(
        COMMAND_DURATION_SECONDS,
        "Write command latency in seconds, including conflict retries"
    );
    describe_counter!(QUERIES_TOTAL, "Read queries by query and outcome");
    describe_counter!(
        CONFLICT_RETRIES_TOTAL,
        "Commands retried after an optimistic concurrency conflict"
    );
    describe_counter!(PROJECTION_APPLIED_TOTAL, "Events applied to the projection");
    describe_counter!(PROJECTION_REBUILDS_TOTAL, "Completed projection rebuilds");
    describe_counter!(
        PROJECTION_RESYNCS_TOTAL,
        "Live feed interruptions that forced a resubscribe and rebuild"
    );
    describe_counter!(AUDIT_PUBLISHED_TOTAL, "Audit records handed to the audit channel");
    describe_counter!(AUDIT_DROPPED_TOTAL, "Audit records that could not be delivered");
    describe_counter!(ERRORS_TOTAL, "Errors by code, category, and severity");
}

/// Write command metrics.
pub struct CommandMetrics;

impl CommandMetrics {
    /// Record one finished command.
    pub fn record(command: &'static str, outcome: &'static str, duration_seconds: f64) {
        counter!(COMMANDS_TOTAL, "command" => command, "outcome" => outcome).increment(1);
        histogram!(COMMAND_DURATION_SECONDS, "command" => command).record(duration_seconds);
    }

    /// Record a retry after a version conflict.
    pub fn conflict_retry(command: &'static str) {
        counter!(CONFLICT_RETRIES_TOTAL, "command" => command).increment(1);
    }
}

/// Read query metrics.
pub struct QueryMetrics;

impl QueryMetrics {
    pub fn record(query: &'static str, outcome: &'static str) {
        counter!(QUERIES_TOTAL, "query" => query, "outcome" => outcome).increment(1);
    }
}

/// Outcome label for a command or query result.
pub fn outcome<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "error"
    }
}
