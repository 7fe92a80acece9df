//! Read-side projection of current config values.
//!
//! The projection is a cache derived from the event log: it can always be
//! discarded and rebuilt by replaying the full log. This module provides:
//!
//! - **`Projection`**: the concurrent key/value view with `apply_event` and `rebuild`
//! - **`ConsistencyPolicy`**: the explicit choice between live updates and
//!   restart-only refresh
//! - **`live`**: `LiveProjector`, the background task that keeps a live projection
//!   current from the backend's event feed

pub mod live;

pub use live::{LiveProjector, LiveProjectorHandle, LiveProjectorStats};

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

use crate::error::{ConfStoreError, Result};
use crate::events::{ConfigEvent, RecordedEvent, StreamId};
use crate::store::EventLog;
use crate::telemetry::metrics as names;

// ═══════════════════════════════════════════════════════════════════════════════
// Policy and Entries
// ═══════════════════════════════════════════════════════════════════════════════

/// How the projection is kept in step with the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyPolicy {
    /// Writes are applied synchronously after append and the backend feed is
    /// consumed in the background. Reads lag writes by a small bounded amount.
    #[default]
    Live,
    /// The projection is refreshed only by `rebuild()`. Writes are durable
    /// immediately but invisible to reads until the next rebuild.
    RestartOnly,
}

impl std::fmt::Display for ConsistencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::RestartOnly => write!(f, "restart_only"),
        }
    }
}

/// One current config value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub value: String,
}

/// What happened to an event handed to `apply_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already reflected (redelivery, or applied synchronously before the feed caught up).
    Duplicate,
    /// An earlier event of the same stream has not been seen. Nothing was applied.
    Gap { expected: u64, found: u64 },
}

/// Point-in-time view of projection bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectionStats {
    pub policy: ConsistencyPolicy,
    pub entries: usize,
    pub streams: usize,
    pub rebuilds: u64,
    pub last_rebuild_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════════════

/// Values of non-deleted keys plus the last applied version of every stream.
#[derive(Debug, Default)]
struct ProjectionState {
    entries: HashMap<String, String>,
    versions: HashMap<StreamId, u64>,
}

impl ProjectionState {
    fn apply(&mut self, record: &RecordedEvent) -> ApplyOutcome {
        let applied = self.versions.get(&record.stream_id).copied().unwrap_or(0);
        if record.stream_version <= applied {
            return ApplyOutcome::Duplicate;
        }
        if record.stream_version != applied + 1 {
            return ApplyOutcome::Gap {
                expected: applied + 1,
                found: record.stream_version,
            };
        }

        match &record.event {
            ConfigEvent::ValueSet(e) => {
                self.entries.insert(e.key.clone(), e.value.clone());
            }
            ConfigEvent::ValueDeleted(e) => {
                self.entries.remove(&e.key);
            }
        }
        self.versions.insert(record.stream_id.clone(), record.stream_version);
        ApplyOutcome::Applied
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: ProjectionState,
    /// Events applied while a rebuild is reading the log. Replayed onto the
    /// rebuilt state before it is swapped in.
    pending: Option<Vec<RecordedEvent>>,
    last_rebuild_at: Option<DateTime<Utc>>,
}

/// Keeps `Inner::pending` collecting for the life of one rebuild.
///
/// Dropping it stops the buffering, so a rebuild that fails or is cancelled
/// mid-read does not leave every later `apply_event` cloning into the buffer.
struct PendingBuffer<'a> {
    inner: &'a RwLock<Inner>,
}

impl<'a> PendingBuffer<'a> {
    fn arm(inner: &'a RwLock<Inner>) -> Self {
        inner.write().pending = Some(Vec::new());
        Self { inner }
    }
}

impl Drop for PendingBuffer<'_> {
    fn drop(&mut self) {
        self.inner.write().pending = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Projection
// ═══════════════════════════════════════════════════════════════════════════════

/// Concurrent read model of current config values.
///
/// Every mutation happens under one short write lock, so readers never see a
/// half-applied event or a partially rebuilt map.
pub struct Projection {
    policy: ConsistencyPolicy,
    inner: RwLock<Inner>,
    rebuild_lock: tokio::sync::Mutex<()>,
    rebuilds: AtomicU64,
}

impl Projection {
    pub fn new(policy: ConsistencyPolicy) -> Self {
        Self {
            policy,
            inner: RwLock::new(Inner::default()),
            rebuild_lock: tokio::sync::Mutex::new(()),
            rebuilds: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> ConsistencyPolicy {
        self.policy
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.read().state.entries.get(key).cloned()
    }

    /// Snapshot of every entry, sorted by name.
    pub fn list_all(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = self
            .inner
            .read()
            .state
            .entries
            .iter()
            .map(|(name, value)| ConfigEntry {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.read().state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last stream version reflected for `key` (0 if none).
    pub fn stream_version(&self, key: &str) -> u64 {
        self.inner
            .read()
            .state
            .versions
            .get(&StreamId::new(key))
            .copied()
            .unwrap_or(0)
    }

    /// Apply one recorded event.
    pub fn apply_event(&self, record: &RecordedEvent) -> ApplyOutcome {
        let outcome = {
            let mut inner = self.inner.write();
            if let Some(pending) = inner.pending.as_mut() {
                pending.push(record.clone());
            }
            inner.state.apply(record)
        };

        match outcome {
            ApplyOutcome::Applied => {
                counter!(names::PROJECTION_APPLIED_TOTAL, "event_type" => record.event_type())
                    .increment(1);
            }
            ApplyOutcome::Duplicate => {
                debug!(
                    stream = %record.stream_id,
                    stream_version = record.stream_version,
                    "Skipping already applied event"
                );
            }
            ApplyOutcome::Gap { expected, found } => {
                debug!(stream = %record.stream_id, expected, found, "Event arrived ahead of its stream");
            }
        }
        outcome
    }

    /// Discard the current view and rebuild it from the entire log.
    ///
    /// The new state is built off to the side and swapped in atomically;
    /// readers keep seeing the old state until the swap. Returns the number of
    /// events replayed.
    #[instrument(skip(self, log), fields(backend = log.name(), policy = %self.policy))]
    pub async fn rebuild(&self, log: &dyn EventLog) -> Result<usize> {
        let _guard = self.rebuild_lock.lock().await;
        let _pending = PendingBuffer::arm(&self.inner);

        let events = match log.read_all_forward().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Projection rebuild could not read the event log");
                return Err(e.into());
            }
        };

        let mut fresh = ProjectionState::default();
        for record in &events {
            if let ApplyOutcome::Gap { expected, found } = fresh.apply(record) {
                return Err(ConfStoreError::internal(format!(
                    "event log out of order for stream {}: expected version {}, found {}",
                    record.stream_id, expected, found
                )));
            }
        }

        let now = Utc::now();
        {
            let mut inner = self.inner.write();
            let pending = inner.pending.take().unwrap_or_default();
            for record in &pending {
                fresh.apply(record);
            }
            inner.state = fresh;
            inner.last_rebuild_at = Some(now);
        }

        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        counter!(names::PROJECTION_REBUILDS_TOTAL).increment(1);
        info!(events = events.len(), entries = self.len(), "Projection rebuilt");
        Ok(events.len())
    }

    pub fn stats(&self) -> ProjectionStats {
        let inner = self.inner.read();
        ProjectionStats {
            policy: self.policy,
            entries: inner.state.entries.len(),
            streams: inner.state.versions.len(),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            last_rebuild_at: inner.last_rebuild_at,
        }
    }
}

impl Default for Projection {
    fn default() -> Self {
        Self::new(ConsistencyPolicy::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventId;
    use crate::store::{AppendAck, ExpectedVersion, InMemoryEventLog, StoreError};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Log whose full read never completes.
    struct StalledLog;

    #[async_trait]
    impl EventLog for StalledLog {
        async fn append(
            &self,
            stream: &StreamId,
            _expected: ExpectedVersion,
            _events: Vec<ConfigEvent>,
        ) -> std::result::Result<AppendAck, StoreError> {
            Err(StoreError::Unavailable(format!("stalled: {}", stream)))
        }

        async fn read_forward(
            &self,
            stream: &StreamId,
        ) -> std::result::Result<Vec<RecordedEvent>, StoreError> {
            Err(StoreError::StreamNotFound(stream.to_string()))
        }

        async fn read_all_forward(&self) -> std::result::Result<Vec<RecordedEvent>, StoreError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    fn record(key: &str, version: u64, event: ConfigEvent) -> RecordedEvent {
        RecordedEvent {
            event_id: EventId::new(),
            stream_id: StreamId::new(key),
            stream_version: version,
            global_position: version,
            recorded_at: Utc::now(),
            event,
        }
    }

    #[test]
    fn test_apply_set_and_delete() {
        let projection = Projection::new(ConsistencyPolicy::Live);

        projection.apply_event(&record("a", 1, ConfigEvent::value_set("a", "1", None)));
        assert_eq!(projection.get("a").as_deref(), Some("1"));

        projection.apply_event(&record("a", 2, ConfigEvent::value_deleted("a", "1")));
        assert_eq!(projection.get("a"), None);
        assert_eq!(projection.stream_version("a"), 2);
    }

    #[test]
    fn test_redelivery_is_ignored() {
        let projection = Projection::default();
        let first = record("a", 1, ConfigEvent::value_set("a", "1", None));
        let second = record("a", 2, ConfigEvent::value_set("a", "2", Some("1".into())));

        assert_eq!(projection.apply_event(&first), ApplyOutcome::Applied);
        assert_eq!(projection.apply_event(&second), ApplyOutcome::Applied);
        assert_eq!(projection.apply_event(&first), ApplyOutcome::Duplicate);
        assert_eq!(projection.get("a").as_deref(), Some("2"));
    }

    #[test]
    fn test_gap_is_reported_and_not_applied() {
        let projection = Projection::default();
        let outcome = projection.apply_event(&record("a", 3, ConfigEvent::value_set("a", "3", None)));

        assert_eq!(outcome, ApplyOutcome::Gap { expected: 1, found: 3 });
        assert_eq!(projection.get("a"), None);
    }

    #[test]
    fn test_list_all_sorted() {
        let projection = Projection::default();
        projection.apply_event(&record("b", 1, ConfigEvent::value_set("b", "2", None)));
        projection.apply_event(&record("a", 1, ConfigEvent::value_set("a", "1", None)));

        let names: Vec<String> = projection.list_all().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_rebuild_replaces_state() {
        let log = InMemoryEventLog::new();
        log.append(&"a".into(), ExpectedVersion::Any, vec![ConfigEvent::value_set("a", "1", None)])
            .await
            .unwrap();
        log.append(&"b".into(), ExpectedVersion::Any, vec![ConfigEvent::value_set("b", "1", None)])
            .await
            .unwrap();
        log.append(&"b".into(), ExpectedVersion::Any, vec![ConfigEvent::value_deleted("b", "1")])
            .await
            .unwrap();

        let projection = Projection::new(ConsistencyPolicy::RestartOnly);
        projection.apply_event(&record("stale", 1, ConfigEvent::value_set("stale", "x", None)));

        let replayed = projection.rebuild(&log).await.unwrap();
        assert_eq!(replayed, 3);
        assert_eq!(projection.get("a").as_deref(), Some("1"));
        assert_eq!(projection.get("b"), None);
        assert_eq!(projection.get("stale"), None);

        let stats = projection.stats();
        assert_eq!(stats.rebuilds, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.streams, 2);
        assert!(stats.last_rebuild_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_state() {
        let log = InMemoryEventLog::new();
        let projection = Projection::default();
        projection.apply_event(&record("a", 1, ConfigEvent::value_set("a", "1", None)));

        log.set_available(false);
        assert!(projection.rebuild(&log).await.is_err());
        assert_eq!(projection.get("a").as_deref(), Some("1"));
        assert_eq!(projection.stats().rebuilds, 0);
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_stops_buffering() {
        let projection = Projection::default();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), projection.rebuild(&StalledLog)).await;
        assert!(cancelled.is_err());

        for version in 1..=100 {
            projection.apply_event(&record("a", version, ConfigEvent::value_set("a", &version.to_string(), None)));
        }
        assert!(projection.inner.read().pending.is_none());
        assert_eq!(projection.get("a").as_deref(), Some("100"));

        // The rebuild lock was released with the cancelled future.
        let log = InMemoryEventLog::new();
        assert_eq!(projection.rebuild(&log).await.unwrap(), 0);
        assert!(projection.inner.read().pending.is_none());
    }

    #[tokio::test]
    async fn test_failed_rebuild_stops_buffering() {
        let log = InMemoryEventLog::new();
        log.set_available(false);
        let projection = Projection::default();

        assert!(projection.rebuild(&log).await.is_err());
        projection.apply_event(&record("a", 1, ConfigEvent::value_set("a", "1", None)));
        assert!(projection.inner.read().pending.is_none());
    }
}
