//! Event log backends.
//!
//! The event log is the source of truth: a durable, per-key ordered,
//! append-only store with optimistic-concurrency appends. The core only talks
//! to it through the [`EventLog`] trait. This module provides:
//!
//! - **`memory`**: `InMemoryEventLog`, the in-process reference implementation
//! - **`file`**: `FileEventLog`, a JSON-lines file adapter
//! - **`timeout`**: `TimeoutEventLog`, a decorator bounding every call with a deadline

pub mod file;
pub mod memory;
pub mod timeout;

pub use file::{FileEventLog, FileEventLogConfig};
pub use memory::InMemoryEventLog;
pub use timeout::TimeoutEventLog;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::{ConfigEvent, EventId, RecordedEvent, StreamId};

// ═══════════════════════════════════════════════════════════════════════════════
// Versions and Acknowledgements
// ═══════════════════════════════════════════════════════════════════════════════

/// The stream version an append expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Append regardless of the current version.
    Any,
    /// The stream must not have any events yet.
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream currently at `current` satisfies this expectation.
    pub fn matches(&self, current: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current == 0,
            Self::Exact(v) => *v == current,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::Exact(v) => write!(f, "version {}", v),
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct AppendAck {
    /// Stream version after the append.
    pub next_version: u64,
    /// The events as they were recorded, in append order.
    pub records: Vec<RecordedEvent>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors from event log operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("version conflict on stream {stream}: expected {expected}, actual {actual}")]
    VersionConflict {
        stream: String,
        expected: ExpectedVersion,
        actual: u64,
    },

    /// Normal outcome for a key that was never written.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("event log unavailable: {0}")]
    Unavailable(String),

    #[error("event log corrupt: {0}")]
    Corrupt(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Log Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for event log backends.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append events to a stream if, and only if, its current version matches
    /// `expected`. All events are written or none are.
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<AppendAck, StoreError>;

    /// Read every event of one stream in append order.
    ///
    /// Returns `StreamNotFound` for a stream that was never written.
    async fn read_forward(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Read every event across every stream in global append order.
    async fn read_all_forward(&self) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Subscribe to events appended from now on, if the backend supports it.
    ///
    /// Order within a stream is preserved. Delivery is at-least-once.
    fn subscribe_all(&self) -> Option<broadcast::Receiver<RecordedEvent>> {
        None
    }

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared In-Memory Index
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-stream and global ordering shared by the in-process backends.
#[derive(Debug, Default)]
pub(crate) struct LogIndex {
    streams: HashMap<StreamId, Vec<RecordedEvent>>,
    all: Vec<RecordedEvent>,
}

impl LogIndex {
    pub(crate) fn stream_version(&self, stream: &StreamId) -> u64 {
        self.streams.get(stream).map_or(0, |events| events.len() as u64)
    }

    /// Check the expectation and stamp `events` with their positions without
    /// inserting them.
    pub(crate) fn prepare(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let current = self.stream_version(stream);
        if !expected.matches(current) {
            return Err(StoreError::VersionConflict {
                stream: stream.to_string(),
                expected,
                actual: current,
            });
        }

        let recorded_at = Utc::now();
        let base_position = self.all.len() as u64;
        Ok(events
            .into_iter()
            .enumerate()
            .map(|(i, event)| RecordedEvent {
                event_id: EventId::new(),
                stream_id: stream.clone(),
                stream_version: current + i as u64 + 1,
                global_position: base_position + i as u64 + 1,
                recorded_at,
                event,
            })
            .collect())
    }

    pub(crate) fn insert(&mut self, records: &[RecordedEvent]) {
        for record in records {
            self.streams
                .entry(record.stream_id.clone())
                .or_default()
                .push(record.clone());
            self.all.push(record.clone());
        }
    }

    pub(crate) fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        self.streams
            .get(stream)
            .cloned()
            .ok_or_else(|| StoreError::StreamNotFound(stream.to_string()))
    }

    pub(crate) fn read_all(&self) -> Vec<RecordedEvent> {
        self.all.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.all.len()
    }
}
