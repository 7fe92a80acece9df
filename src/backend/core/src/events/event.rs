//! Event definitions for the configuration store.
//!
//! This module provides:
//! - `ConfigEvent`, the closed set of state transitions for a config key
//! - `RecordedEvent`, an event as persisted by the event log
//! - Identifier types for events and streams

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Event IDs
// =============================================================================

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a stream. Each config key owns exactly one stream,
/// named after the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

// =============================================================================
// Domain Events
// =============================================================================

/// Event: a config value was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSet {
    #[serde(alias = "config_name")]
    pub key: String,
    pub value: String,
    /// Value replaced by this write, for audit lineage. `None` on first write.
    pub previous_value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Event: a config value was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDeleted {
    #[serde(alias = "config_name")]
    pub key: String,
    pub deleted_value: String,
    pub timestamp: DateTime<Utc>,
}

/// All state transitions of a config key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConfigEvent {
    ValueSet(ValueSet),
    ValueDeleted(ValueDeleted),
}

impl ConfigEvent {
    /// Build a `ValueSet` stamped with the current UTC time.
    pub fn value_set(
        key: impl Into<String>,
        value: impl Into<String>,
        previous_value: Option<String>,
    ) -> Self {
        ConfigEvent::ValueSet(ValueSet {
            key: key.into(),
            value: value.into(),
            previous_value,
            timestamp: Utc::now(),
        })
    }

    /// Build a `ValueDeleted` stamped with the current UTC time.
    pub fn value_deleted(key: impl Into<String>, deleted_value: impl Into<String>) -> Self {
        ConfigEvent::ValueDeleted(ValueDeleted {
            key: key.into(),
            deleted_value: deleted_value.into(),
            timestamp: Utc::now(),
        })
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            ConfigEvent::ValueSet(_) => "ValueSet",
            ConfigEvent::ValueDeleted(_) => "ValueDeleted",
        }
    }

    /// The config key this event belongs to.
    pub fn key(&self) -> &str {
        match self {
            ConfigEvent::ValueSet(e) => &e.key,
            ConfigEvent::ValueDeleted(e) => &e.key,
        }
    }

    /// Get the stream ID this event belongs to.
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.key())
    }

    /// When the event was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ConfigEvent::ValueSet(e) => e.timestamp,
            ConfigEvent::ValueDeleted(e) => e.timestamp,
        }
    }

    /// The event payload without its type tag, as a JSON object.
    pub fn data(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        let value = match self {
            ConfigEvent::ValueSet(e) => serde_json::to_value(e)?,
            ConfigEvent::ValueDeleted(e) => serde_json::to_value(e)?,
        };
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        }
    }
}

// =============================================================================
// Recorded Events
// =============================================================================

/// An event as stored in the log, with its position metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique event identifier
    pub event_id: EventId,

    /// Stream this event belongs to
    pub stream_id: StreamId,

    /// 1-based position of this event within its stream
    pub stream_version: u64,

    /// 1-based position of this event across all streams
    pub global_position: u64,

    /// When the log accepted the event
    pub recorded_at: DateTime<Utc>,

    /// The event data
    pub event: ConfigEvent,
}

impl RecordedEvent {
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}
