//! Error handling for the configuration store core.
//!
//! This module provides:
//! - A single error type carrying a stable, machine-readable [`ErrorCode`]
//! - User-facing messages kept apart from internal diagnostics
//! - Severity-driven logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Expected outcomes (`NotFound`, `AlreadyDeleted`) are plain values of this
//! type and are never logged above debug. `Internal` marks a broken invariant
//! and is logged at error level the moment it is constructed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use confstore_core::error::{ConfStoreError, ErrorCode, Result};
//!
//! fn lookup(key: &str) -> Result<String> {
//!     Err(ConfStoreError::not_found(key))
//! }
//!
//! assert_eq!(lookup("x").unwrap_err().code(), ErrorCode::NotFound);
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::store::StoreError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for configuration store operations.
pub type Result<T> = std::result::Result<T, ConfStoreError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// Callers (for example an HTTP layer) map these to their own status codes;
/// the core has no notion of transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Domain outcomes (1000-1099)
    NotFound,
    AlreadyDeleted,
    InvalidInput,
    InvalidTimestamp,

    // Concurrency (1100-1199)
    VersionConflict,
    Conflict,

    // Backend (2000-2099)
    Unavailable,
    Serialization,

    // Configuration (5000-5099)
    Configuration,

    // Internal (9000-9099)
    Internal,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::NotFound => 1000,
            Self::AlreadyDeleted => 1001,
            Self::InvalidInput => 1002,
            Self::InvalidTimestamp => 1003,

            Self::VersionConflict => 1100,
            Self::Conflict => 1101,

            Self::Unavailable => 2000,
            Self::Serialization => 2001,

            Self::Configuration => 5000,

            Self::Internal => 9000,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict | Self::Unavailable)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "domain",
            1100..=1199 => "concurrency",
            2000..=2099 => "backend",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected outcomes and bad input
    Low,
    /// Contention between writers
    Medium,
    /// Backend and configuration failures
    High,
    /// Invariant violations
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::NotFound
            | ErrorCode::AlreadyDeleted
            | ErrorCode::InvalidInput
            | ErrorCode::InvalidTimestamp => Self::Low,

            ErrorCode::VersionConflict | ErrorCode::Conflict => Self::Medium,

            ErrorCode::Unavailable | ErrorCode::Serialization | ErrorCode::Configuration => {
                Self::High
            }

            ErrorCode::Internal => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the configuration store core.
#[derive(Error, Debug)]
pub struct ConfStoreError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Key the failed operation targeted, when there is one
    key: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConfStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConfStoreError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            key: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal (invariant violation) error. Logged immediately.
    pub fn internal(message: impl Into<String>) -> Self {
        let error = Self::with_internal(ErrorCode::Internal, "An internal error occurred", message);
        error.log();
        error
    }

    /// The key is absent, was never written, or is deleted.
    pub fn not_found(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorCode::NotFound, format!("config not found: {}", key)).with_key(key)
    }

    /// Delete requested on a key that is already tombstoned.
    pub fn already_deleted(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorCode::AlreadyDeleted, format!("config already deleted: {}", key))
            .with_key(key)
    }

    /// Malformed key or value.
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Malformed time-travel timestamp.
    pub fn invalid_timestamp(raw: impl Into<String>, reason: impl fmt::Display) -> Self {
        let raw = raw.into();
        Self::with_internal(
            ErrorCode::InvalidTimestamp,
            format!("invalid RFC3339 timestamp: {}", raw),
            reason.to_string(),
        )
    }

    /// A concurrent writer won the race and the single retry lost as well.
    pub fn conflict(key: impl Into<String>, attempts: u32) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::Conflict,
            format!("concurrent modification of config: {}", key),
            format!("version conflict persisted after {} attempts", attempts),
        )
        .with_key(key)
    }

    /// Backend I/O failure or timeout.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::Unavailable, "event log unavailable", message)
    }

    /// Configuration could not be loaded or is inconsistent.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::Configuration, "invalid configuration", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the key the operation targeted.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the key the failed operation targeted (if any).
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    key = ?self.key,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    key = ?self.key,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    key = ?self.key,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    key = ?self.key,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            crate::telemetry::metrics::ERRORS_TOTAL,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<StoreError> for ConfStoreError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { ref stream, expected, actual } => Self::with_internal(
                ErrorCode::VersionConflict,
                format!("stream {} was modified concurrently", stream),
                format!("expected {}, actual version {}", expected, actual),
            )
            .with_key(stream.clone()),
            StoreError::StreamNotFound(ref stream) => Self::not_found(stream.clone()),
            StoreError::Unavailable(ref reason) => Self::unavailable(reason.clone()),
            StoreError::Corrupt(ref reason) => {
                let message = format!("event log corrupt: {}", reason);
                Self::internal(message).with_source(error)
            }
        }
    }
}

impl From<serde_json::Error> for ConfStoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(ErrorCode::Serialization, "failed to encode event", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for ConfStoreError {
    fn from(error: std::io::Error) -> Self {
        Self::unavailable(error.to_string()).with_source(error)
    }
}

impl From<config::ConfigError> for ConfStoreError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(error.to_string()).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
