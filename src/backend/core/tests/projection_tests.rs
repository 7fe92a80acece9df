//! Integration tests for projection consistency policies.
//!
//! Covers restart-only refresh, live updates from the backend feed, and
//! agreement between a rebuilt projection and the event log.

use std::collections::BTreeMap;
use std::result::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use confstore_core::prelude::*;
use tokio::sync::{broadcast, Notify};

// ============================================================================
// Test Utilities
// ============================================================================

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Event log whose first full read takes its snapshot, then parks until resumed.
struct PausedRebuildLog {
    inner: InMemoryEventLog,
    armed: AtomicBool,
    snapshot_taken: Notify,
    resume: Notify,
}

impl PausedRebuildLog {
    fn new() -> Self {
        Self {
            inner: InMemoryEventLog::new(),
            armed: AtomicBool::new(true),
            snapshot_taken: Notify::new(),
            resume: Notify::new(),
        }
    }
}

#[async_trait]
impl EventLog for PausedRebuildLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<AppendAck, StoreError> {
        self.inner.append(stream, expected, events).await
    }

    async fn read_forward(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        self.inner.read_forward(stream).await
    }

    async fn read_all_forward(&self) -> Result<Vec<RecordedEvent>, StoreError> {
        let events = self.inner.read_all_forward().await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.snapshot_taken.notify_one();
            self.resume.notified().await;
        }
        events
    }

    fn subscribe_all(&self) -> Option<broadcast::Receiver<RecordedEvent>> {
        self.inner.subscribe_all()
    }

    fn name(&self) -> &'static str {
        "paused"
    }
}

/// Current values computed straight from the log.
async fn fold_log(log: &dyn EventLog) -> BTreeMap<String, String> {
    let mut state = BTreeMap::new();
    for record in log.read_all_forward().await.unwrap() {
        match record.event {
            ConfigEvent::ValueSet(e) => {
                state.insert(e.key, e.value);
            }
            ConfigEvent::ValueDeleted(e) => {
                state.remove(&e.key);
            }
        }
    }
    state
}

fn as_map(entries: Vec<ConfigEntry>) -> BTreeMap<String, String> {
    entries.into_iter().map(|e| (e.name, e.value)).collect()
}

// ============================================================================
// Restart-Only Policy
// ============================================================================

#[tokio::test]
async fn test_restart_only_hides_writes_until_rebuild() {
    let log = Arc::new(InMemoryEventLog::new());
    let service = ConfigService::new(log.clone(), ConsistencyPolicy::RestartOnly);

    service.put("k", "v").await.unwrap();
    assert_eq!(service.get("k").unwrap_err().code(), ErrorCode::NotFound);
    // The write is durable: history sees it immediately.
    assert_eq!(service.history("k").await.unwrap().len(), 1);

    service.rebuild_projection().await.unwrap();
    assert_eq!(service.get("k").unwrap(), "v");
}

#[tokio::test]
async fn test_restart_simulated_with_fresh_service() {
    let log = Arc::new(InMemoryEventLog::new());
    {
        let first = ConfigService::new(log.clone(), ConsistencyPolicy::Live);
        first.put("a", "1").await.unwrap();
        first.put("b", "2").await.unwrap();
        first.delete("a").await.unwrap();
    }

    let second = ConfigService::new(log.clone(), ConsistencyPolicy::RestartOnly);
    second.rebuild_projection().await.unwrap();
    assert_eq!(as_map(second.all()), fold_log(log.as_ref()).await);
    assert_eq!(second.projection_stats().rebuilds, 1);
}

// ============================================================================
// Live Policy
// ============================================================================

#[tokio::test]
async fn test_live_projection_sees_other_writers() {
    let log = Arc::new(InMemoryEventLog::new());
    let reader = ConfigService::new(log.clone(), ConsistencyPolicy::Live)
        .with_reconnect_backoff(Duration::from_millis(10));
    let handle = reader.start_live_projection().unwrap();
    wait_until(|| handle.stats().syncs() >= 1).await;

    // A second facade over the same log stands in for another process.
    let writer = ConfigService::new(log.clone(), ConsistencyPolicy::Live);
    writer.put("shared", "1").await.unwrap();

    wait_until(|| reader.get("shared").is_ok()).await;
    assert_eq!(reader.get("shared").unwrap(), "1");

    handle.stop().await;
}

#[tokio::test]
async fn test_live_projection_recovers_after_disconnect() {
    let log = Arc::new(InMemoryEventLog::new());
    let service = ConfigService::new(log.clone(), ConsistencyPolicy::Live)
        .with_reconnect_backoff(Duration::from_millis(10));
    let handle = service.start_live_projection().unwrap();
    wait_until(|| handle.stats().syncs() >= 1).await;

    log.disconnect_subscribers();
    // Written by another facade while the feed is down.
    let other = ConfigService::new(log.clone(), ConsistencyPolicy::RestartOnly);
    other.put("missed", "x").await.unwrap();

    wait_until(|| service.get("missed").is_ok()).await;
    assert!(handle.stats().resyncs() >= 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_live_projection_recovers_after_outage() {
    let log = Arc::new(InMemoryEventLog::new());
    log.set_available(false);

    let service = ConfigService::new(log.clone(), ConsistencyPolicy::Live)
        .with_reconnect_backoff(Duration::from_millis(10));
    let handle = service.start_live_projection().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.stats().syncs(), 0);
    assert!(!handle.is_finished());

    log.set_available(true);
    wait_until(|| handle.stats().syncs() >= 1).await;
    service.put("k", "v").await.unwrap();
    assert_eq!(service.get("k").unwrap(), "v");

    handle.stop().await;
}

#[tokio::test]
async fn test_lagging_subscriber_resynchronises() {
    let log = Arc::new(InMemoryEventLog::with_feed_capacity(2));
    let service = ConfigService::new(log.clone(), ConsistencyPolicy::Live)
        .with_reconnect_backoff(Duration::from_millis(10));
    let handle = service.start_live_projection().unwrap();
    wait_until(|| handle.stats().syncs() >= 1).await;

    let writer = ConfigService::new(log.clone(), ConsistencyPolicy::RestartOnly);
    for i in 0..50 {
        writer.put(&format!("key.{:02}", i), &i.to_string()).await.unwrap();
    }

    let expected = fold_log(log.as_ref()).await;
    wait_until(|| as_map(service.all()) == expected).await;

    handle.stop().await;
}

// ============================================================================
// Rebuild Agreement
// ============================================================================

#[tokio::test]
async fn test_rebuild_matches_log_fold() {
    let log = Arc::new(InMemoryEventLog::new());
    let service = ConfigService::new(log.clone(), ConsistencyPolicy::Live);

    for i in 0..20 {
        let key = format!("k{}", i % 7);
        service.put(&key, &format!("v{}", i)).await.unwrap();
        if i % 3 == 0 {
            let _ = service.delete(&key).await;
        }
    }
    let before = as_map(service.all());

    service.rebuild_projection().await.unwrap();
    let after = as_map(service.all());

    let expected = fold_log(log.as_ref()).await;
    assert_eq!(before, expected);
    assert_eq!(after, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writes_during_rebuild_survive_the_swap() {
    let log = Arc::new(PausedRebuildLog::new());
    let service = ConfigService::new(log.clone(), ConsistencyPolicy::Live);
    service.put("a", "1").await.unwrap();
    service.put("gone", "x").await.unwrap();

    let rebuild = {
        let service = service.clone();
        tokio::spawn(async move { service.rebuild_projection().await })
    };
    log.snapshot_taken.notified().await;

    // Committed after the rebuild's snapshot, before its swap.
    service.put("a", "2").await.unwrap();
    service.put("b", "1").await.unwrap();
    service.delete("gone").await.unwrap();
    assert_eq!(service.get("a").unwrap(), "2");

    log.resume.notify_one();
    assert_eq!(rebuild.await.unwrap().unwrap(), 2);

    assert_eq!(service.get("a").unwrap(), "2");
    assert_eq!(service.get("b").unwrap(), "1");
    assert_eq!(service.get("gone").unwrap_err().code(), ErrorCode::NotFound);
    assert_eq!(as_map(service.all()), fold_log(&log.inner).await);
    assert_eq!(service.projection_stats().rebuilds, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebuild_concurrent_with_writes_loses_nothing() {
    let log = Arc::new(InMemoryEventLog::new());
    let service = ConfigService::new(log.clone(), ConsistencyPolicy::Live);
    for i in 0..200 {
        service.put(&format!("seed.{}", i), "s").await.unwrap();
    }

    let writer = {
        let service = service.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                service.put(&format!("live.{}", i), "l").await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for _ in 0..5 {
        service.rebuild_projection().await.unwrap();
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    assert_eq!(as_map(service.all()), fold_log(log.as_ref()).await);
    assert_eq!(service.all().len(), 300);
}
