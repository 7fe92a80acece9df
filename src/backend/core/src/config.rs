//! Configuration management.
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! `CONFSTORE__`-prefixed environment variables (`__` separates sections, e.g.
//! `CONFSTORE__PROJECTION__POLICY=restart_only`). Durations are written in
//! humantime form (`"5s"`, `"250ms"`).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfStoreError, Result};
use crate::projection::ConsistencyPolicy;
use crate::telemetry::LoggingConfig;

const ENV_PREFIX: &str = "CONFSTORE";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Event log backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Read-side projection
    #[serde(default)]
    pub projection: ProjectionConfig,

    /// Audit notifications
    #[serde(default)]
    pub audit: AuditConfig,

    /// Input limits enforced by the facade
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which event log backend to open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Log file path (file backend only)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Deadline for every backend call
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// fsync after each append (file backend only)
    #[serde(default = "default_sync_on_append")]
    pub sync_on_append: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: None,
            timeout: default_store_timeout(),
            sync_on_append: default_sync_on_append(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectionConfig {
    #[serde(default)]
    pub policy: ConsistencyPolicy,

    /// Delay before resubscribing after the live feed drops
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Events buffered per live feed subscriber
    #[serde(default = "default_feed_buffer")]
    pub feed_buffer: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            policy: ConsistencyPolicy::default(),
            reconnect_backoff: default_reconnect_backoff(),
            feed_buffer: default_feed_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,

    /// Audit records buffered before new ones are dropped
    #[serde(default = "default_audit_buffer_size")]
    pub buffer_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            buffer_size: default_audit_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimitsConfig {
    /// Maximum key length in bytes
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,

    /// Maximum value length in bytes
    #[serde(default = "default_max_value_len")]
    pub max_value_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_len: default_max_key_len(),
            max_value_len: default_max_value_len(),
        }
    }
}

// Default value functions
fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sync_on_append() -> bool {
    true
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_feed_buffer() -> usize {
    1024
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_buffer_size() -> usize {
    256
}

fn default_max_key_len() -> usize {
    256
}

fn default_max_value_len() -> usize {
    65536
}

impl Config {
    /// Load configuration from defaults and environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path; environment variables still override.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == BackendKind::File && self.store.path.is_none() {
            return Err(ConfStoreError::configuration(
                "store.path is required for the file backend",
            ));
        }
        if self.store.timeout.is_zero() {
            return Err(ConfStoreError::configuration("store.timeout must be positive"));
        }
        if self.projection.feed_buffer == 0 {
            return Err(ConfStoreError::configuration(
                "projection.feed_buffer must be positive",
            ));
        }
        if self.audit.enabled && self.audit.buffer_size == 0 {
            return Err(ConfStoreError::configuration("audit.buffer_size must be positive"));
        }
        if self.limits.max_key_len == 0 || self.limits.max_value_len == 0 {
            return Err(ConfStoreError::configuration("limits must be positive"));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
