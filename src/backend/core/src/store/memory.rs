//! In-process reference event log.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{AppendAck, EventLog, ExpectedVersion, LogIndex, StoreError};
use crate::events::{ConfigEvent, RecordedEvent, StreamId};

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Event log held entirely in memory.
///
/// Appends check the expected version, insert, and publish to the broadcast
/// feed under one write lock, so an append is atomic with respect to every
/// reader and subscribers see events in global append order.
pub struct InMemoryEventLog {
    index: RwLock<LogIndex>,
    feed: RwLock<broadcast::Sender<RecordedEvent>>,
    feed_capacity: usize,
    available: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// Create a log whose live feed buffers up to `capacity` events per
    /// subscriber before slow subscribers start lagging.
    pub fn with_feed_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            index: RwLock::new(LogIndex::default()),
            feed: RwLock::new(sender),
            feed_capacity: capacity,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "In-memory event log availability changed");
    }

    /// Drop the current live feed. Existing subscribers observe the feed as
    /// closed and must subscribe again.
    pub fn disconnect_subscribers(&self) {
        let (sender, _) = broadcast::channel(self.feed_capacity);
        *self.feed.write() = sender;
        info!("In-memory event log feed reset");
    }

    /// Total number of events across all streams.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory event log is offline".to_string()))
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<AppendAck, StoreError> {
        self.ensure_available()?;

        let (records, next_version) = {
            let mut index = self.index.write();
            let records = index.prepare(stream, expected, events)?;
            index.insert(&records);

            // Publish before releasing the index lock so the feed sees appends
            // in log order. No subscribers is not an error.
            let feed = self.feed.read();
            for record in &records {
                let _ = feed.send(record.clone());
            }
            (records, index.stream_version(stream))
        };

        debug!(stream = %stream, next_version, count = records.len(), "Events appended");

        Ok(AppendAck { next_version, records })
    }

    async fn read_forward(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        self.ensure_available()?;
        self.index.read().read_stream(stream)
    }

    async fn read_all_forward(&self) -> Result<Vec<RecordedEvent>, StoreError> {
        self.ensure_available()?;
        Ok(self.index.read().read_all())
    }

    fn subscribe_all(&self) -> Option<broadcast::Receiver<RecordedEvent>> {
        Some(self.feed.read().subscribe())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str) -> Vec<ConfigEvent> {
        vec![ConfigEvent::value_set(key, value, None)]
    }

    #[tokio::test]
    async fn test_append_and_read_forward() {
        let log = InMemoryEventLog::new();
        let stream = StreamId::new("x");

        let ack = log.append(&stream, ExpectedVersion::Exact(0), set("x", "a")).await.unwrap();
        assert_eq!(ack.next_version, 1);
        let ack = log.append(&stream, ExpectedVersion::Exact(1), set("x", "b")).await.unwrap();
        assert_eq!(ack.next_version, 2);

        let events = log.read_forward(&stream).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stream_version, 1);
        assert_eq!(events[1].stream_version, 2);
    }

    #[tokio::test]
    async fn test_empty_append_reports_current_version() {
        let log = InMemoryEventLog::new();
        let stream = StreamId::new("x");
        log.append(&stream, ExpectedVersion::Any, set("x", "a")).await.unwrap();
        log.append(&stream, ExpectedVersion::Any, set("x", "b")).await.unwrap();

        let ack = log.append(&stream, ExpectedVersion::Exact(2), Vec::new()).await.unwrap();
        assert_eq!(ack.next_version, 2);
        assert!(ack.records.is_empty());
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_append_rejected_atomically() {
        let log = InMemoryEventLog::new();
        let stream = StreamId::new("x");
        log.append(&stream, ExpectedVersion::Exact(0), set("x", "a")).await.unwrap();

        let batch = vec![
            ConfigEvent::value_set("x", "b", None),
            ConfigEvent::value_set("x", "c", None),
        ];
        let err = log.append(&stream, ExpectedVersion::Exact(0), batch).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { actual: 1, .. }));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_stream_not_found() {
        let log = InMemoryEventLog::new();
        let err = log.read_forward(&StreamId::new("missing")).await.unwrap_err();
        assert!(matches!(err, StoreError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_read_all_in_global_order() {
        let log = InMemoryEventLog::new();
        log.append(&"a".into(), ExpectedVersion::Any, set("a", "1")).await.unwrap();
        log.append(&"b".into(), ExpectedVersion::Any, set("b", "1")).await.unwrap();
        log.append(&"a".into(), ExpectedVersion::Any, set("a", "2")).await.unwrap();

        let all = log.read_all_forward().await.unwrap();
        let keys: Vec<&str> = all.iter().map(|r| r.stream_id.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_appends() {
        let log = InMemoryEventLog::new();
        let mut rx = log.subscribe_all().unwrap();

        log.append(&"a".into(), ExpectedVersion::Any, set("a", "1")).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.stream_id.as_str(), "a");
        assert_eq!(received.global_position, 1);
    }

    #[tokio::test]
    async fn test_disconnect_closes_feed() {
        let log = InMemoryEventLog::new();
        let mut rx = log.subscribe_all().unwrap();
        log.disconnect_subscribers();

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_offline_log_is_unavailable() {
        let log = InMemoryEventLog::new();
        log.set_available(false);

        let err = log.read_all_forward().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        let err = log.append(&"a".into(), ExpectedVersion::Any, set("a", "1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        log.set_available(true);
        assert!(log.read_all_forward().await.unwrap().is_empty());
    }
}
