//! CQRS facade over the event log and the projection.
//!
//! Commands (`put`, `delete`) load the key's stream, replay it into a
//! [`ConfigAggregate`], let the aggregate decide the next event, and append it
//! with the version they observed. A lost race is retried once from scratch.
//! Queries (`get`, `all`) read the projection; `history` and `at` read the
//! log directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditPublisher, AuditRecord};
use crate::config::{BackendKind, Config, LimitsConfig};
use crate::error::{ConfStoreError, Result};
use crate::events::{Aggregate, ConfigAggregate, ConfigEvent, RecordedEvent, StreamId};
use crate::projection::{
    ApplyOutcome, ConfigEntry, ConsistencyPolicy, LiveProjector, LiveProjectorHandle,
    Projection, ProjectionStats,
};
use crate::store::{
    AppendAck, EventLog, ExpectedVersion, FileEventLog, FileEventLogConfig, InMemoryEventLog,
    StoreError, TimeoutEventLog,
};
use crate::telemetry::metrics::{describe_metrics, outcome, CommandMetrics, QueryMetrics};

/// Attempts per command: the original try plus one retry after a conflict.
const MAX_ATTEMPTS: u32 = 2;

const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// One entry of a key's history, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub event_type: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
    pub stream_version: u64,
}

impl HistoryEntry {
    fn from_record(record: &RecordedEvent) -> Result<Self> {
        Ok(Self {
            event_type: record.event_type().to_string(),
            data: record.event.data()?,
            recorded_at: record.recorded_at,
            stream_version: record.stream_version,
        })
    }
}

/// The configuration store facade.
#[derive(Clone)]
pub struct ConfigService {
    log: Arc<dyn EventLog>,
    projection: Arc<Projection>,
    audit: AuditPublisher,
    limits: LimitsConfig,
    reconnect_backoff: Duration,
}

impl ConfigService {
    /// Create a facade over `log` with an empty projection, no audit channel
    /// and default limits.
    pub fn new(log: Arc<dyn EventLog>, policy: ConsistencyPolicy) -> Self {
        Self {
            log,
            projection: Arc::new(Projection::new(policy)),
            audit: AuditPublisher::disabled(),
            limits: LimitsConfig::default(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    pub fn with_audit(mut self, audit: AuditPublisher) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Open the configured backend, wrap it with the call deadline, and build
    /// the facade. Returns the audit receiver when audit is enabled.
    ///
    /// The projection starts empty; call [`rebuild_projection`](Self::rebuild_projection)
    /// or [`start_live_projection`](Self::start_live_projection) before serving reads.
    pub fn from_config(config: &Config) -> Result<(Self, Option<mpsc::Receiver<AuditRecord>>)> {
        config.validate()?;
        describe_metrics();

        let backend: Arc<dyn EventLog> = match config.store.backend {
            BackendKind::Memory => Arc::new(InMemoryEventLog::with_feed_capacity(
                config.projection.feed_buffer,
            )),
            BackendKind::File => {
                let path = config.store.path.clone().ok_or_else(|| {
                    ConfStoreError::configuration("store.path is required for the file backend")
                })?;
                let mut file_config = FileEventLogConfig::new(path);
                file_config.sync_on_append = config.store.sync_on_append;
                file_config.feed_capacity = config.projection.feed_buffer;
                Arc::new(FileEventLog::open(file_config)?)
            }
        };
        let log = Arc::new(TimeoutEventLog::new(backend, config.store.timeout));

        let (audit, receiver) = if config.audit.enabled {
            let (publisher, receiver) = AuditPublisher::channel(config.audit.buffer_size);
            (publisher, Some(receiver))
        } else {
            (AuditPublisher::disabled(), None)
        };

        info!(
            backend = log.name(),
            policy = %config.projection.policy,
            audit = config.audit.enabled,
            "Config service created"
        );

        let service = Self::new(log, config.projection.policy)
            .with_audit(audit)
            .with_limits(config.limits)
            .with_reconnect_backoff(config.projection.reconnect_backoff);
        Ok((service, receiver))
    }

    pub fn policy(&self) -> ConsistencyPolicy {
        self.projection.policy()
    }

    pub fn projection(&self) -> &Arc<Projection> {
        &self.projection
    }

    pub fn event_log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────

    /// Write `value` under `key`. Returns the value written.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn put(&self, key: &str, value: &str) -> Result<String> {
        let started = Instant::now();
        let result: Result<String> = async {
            self.check_limits(key, Some(value))?;
            self.execute("put", key, |aggregate| aggregate.set_value(key, value))
                .await?;
            Ok(value.to_string())
        }
        .await;

        CommandMetrics::record("put", outcome(&result), started.elapsed().as_secs_f64());
        result
    }

    /// Delete `key`.
    ///
    /// `NotFound` if the key was never written, `AlreadyDeleted` if it is
    /// already deleted.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let started = Instant::now();
        let result: Result<()> = async {
            self.check_limits(key, None)?;
            self.execute("delete", key, |aggregate| aggregate.delete_value(key))
                .await?;
            Ok(())
        }
        .await;

        CommandMetrics::record("delete", outcome(&result), started.elapsed().as_secs_f64());
        result
    }

    /// Load, decide, append; retry once on a version conflict.
    async fn execute<F>(&self, command: &'static str, key: &str, decide: F) -> Result<AppendAck>
    where
        F: Fn(&ConfigAggregate) -> Result<(ConfigEvent, ConfigAggregate)>,
    {
        let stream = StreamId::new(key);

        for attempt in 1..=MAX_ATTEMPTS {
            let history = self.load_stream(&stream).await?;
            let aggregate = ConfigAggregate::replay(history.iter().map(|r| &r.event));
            let (event, next) = decide(&aggregate)?;

            match self
                .log
                .append(&stream, ExpectedVersion::Exact(aggregate.version), vec![event])
                .await
            {
                Ok(ack) => {
                    debug!(
                        command,
                        attempt,
                        stream_version = ack.next_version,
                        "Command committed"
                    );
                    debug_assert_eq!(ack.next_version, next.version);
                    self.after_append(&stream, &ack).await;
                    return Ok(ack);
                }
                Err(StoreError::VersionConflict { actual, .. }) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        command,
                        attempt,
                        observed = aggregate.version,
                        actual,
                        "Version conflict, retrying"
                    );
                    CommandMetrics::conflict_retry(command);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    let error = ConfStoreError::conflict(key, attempt);
                    error.log();
                    return Err(error);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ConfStoreError::conflict(key, MAX_ATTEMPTS))
    }

    /// Reflect a committed append in the projection (live policy only) and
    /// notify audit. Neither step can fail the command.
    async fn after_append(&self, stream: &StreamId, ack: &AppendAck) {
        if self.policy() == ConsistencyPolicy::Live {
            for record in &ack.records {
                if let ApplyOutcome::Gap { .. } = self.projection.apply_event(record) {
                    // A concurrent writer's earlier event is not applied yet.
                    self.catch_up(stream).await;
                    break;
                }
            }
        }
        self.audit.publish(&ack.records);
    }

    /// Apply every event of one stream; already applied ones are skipped.
    async fn catch_up(&self, stream: &StreamId) {
        match self.log.read_forward(stream).await {
            Ok(events) => {
                for record in &events {
                    self.projection.apply_event(record);
                }
            }
            Err(e) => {
                warn!(
                    stream = %stream,
                    error = %e,
                    "Projection catch-up failed, waiting for the live feed"
                );
            }
        }
    }

    fn check_limits(&self, key: &str, value: Option<&str>) -> Result<()> {
        if key.len() > self.limits.max_key_len {
            return Err(ConfStoreError::invalid_input(format!(
                "key exceeds {} bytes",
                self.limits.max_key_len
            ))
            .with_key(key));
        }
        if let Some(value) = value {
            if value.len() > self.limits.max_value_len {
                return Err(ConfStoreError::invalid_input(format!(
                    "value exceeds {} bytes",
                    self.limits.max_value_len
                ))
                .with_key(key));
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Current value of `key` from the projection.
    pub fn get(&self, key: &str) -> Result<String> {
        let result = self
            .projection
            .get(key)
            .ok_or_else(|| ConfStoreError::not_found(key));
        QueryMetrics::record("get", outcome(&result));
        result
    }

    /// Every current entry from the projection, sorted by name.
    pub fn all(&self) -> Vec<ConfigEntry> {
        QueryMetrics::record("all", "ok");
        self.projection.list_all()
    }

    /// Full event history of `key`, oldest first. Empty for an unknown key.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn history(&self, key: &str) -> Result<Vec<HistoryEntry>> {
        let result: Result<Vec<HistoryEntry>> = async {
            let events = self.load_stream(&StreamId::new(key)).await?;
            events.iter().map(HistoryEntry::from_record).collect()
        }
        .await;
        QueryMetrics::record("history", outcome(&result));
        result
    }

    /// Value of `key` as of the RFC3339 timestamp `at` (inclusive).
    pub async fn at(&self, key: &str, at: &str) -> Result<String> {
        let timestamp = parse_timestamp(at)?;
        self.at_time(key, timestamp).await
    }

    /// Value of `key` as of `timestamp` (inclusive).
    #[instrument(skip(self), fields(key = %key, at = %timestamp))]
    pub async fn at_time(&self, key: &str, timestamp: DateTime<Utc>) -> Result<String> {
        let result: Result<String> = async {
            let events = self.load_stream(&StreamId::new(key)).await?;
            let aggregate = ConfigAggregate::replay(
                events
                    .iter()
                    .map(|r| &r.event)
                    .filter(|e| e.timestamp() <= timestamp),
            );
            // `current_value` is `None` both before the first write and
            // while deleted.
            aggregate
                .current_value()
                .map(str::to_string)
                .ok_or_else(|| ConfStoreError::not_found(key))
        }
        .await;
        QueryMetrics::record("at", outcome(&result));
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Projection lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild the projection from the whole log. Returns the number of
    /// events replayed.
    pub async fn rebuild_projection(&self) -> Result<usize> {
        self.projection.rebuild(self.log.as_ref()).await
    }

    /// Start consuming the backend feed under the live policy.
    ///
    /// Returns `None` under `RestartOnly`, where the projection only changes
    /// on rebuild.
    pub fn start_live_projection(&self) -> Option<LiveProjectorHandle> {
        match self.policy() {
            ConsistencyPolicy::Live => Some(
                LiveProjector::new(self.projection.clone(), self.log.clone())
                    .with_reconnect_backoff(self.reconnect_backoff)
                    .start(),
            ),
            ConsistencyPolicy::RestartOnly => None,
        }
    }

    pub fn projection_stats(&self) -> ProjectionStats {
        self.projection.stats()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Read one stream, treating an unknown stream as empty, and check that
    /// the backend returned a well-formed sequence.
    async fn load_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>> {
        let events = match self.log.read_forward(stream).await {
            Ok(events) => events,
            Err(StoreError::StreamNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        for (i, record) in events.iter().enumerate() {
            let expected = i as u64 + 1;
            if record.stream_version != expected {
                return Err(ConfStoreError::internal(format!(
                    "stream {} returned version {} at position {}",
                    stream, record.stream_version, expected
                ))
                .with_key(stream.as_str()));
            }
            if record.stream_id != *stream || record.event.key() != stream.as_str() {
                return Err(ConfStoreError::internal(format!(
                    "stream {} returned an event for key {}",
                    stream,
                    record.event.key()
                ))
                .with_key(stream.as_str()));
            }
        }
        Ok(events)
    }
}

/// Parse an RFC3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConfStoreError::invalid_timestamp(raw, e))
}
