//! Background consumer of the event log's live feed.

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ApplyOutcome, Projection};
use crate::store::EventLog;
use crate::telemetry::metrics as names;

const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// Counters shared between a running projector and its handle.
#[derive(Debug, Clone, Default)]
pub struct LiveProjectorStats {
    /// Feed events applied to the projection
    pub applied: Arc<AtomicU64>,
    /// Completed subscribe-and-rebuild cycles, including the first one
    pub syncs: Arc<AtomicU64>,
    /// Times the feed was dropped (lag, gap, or close) and re-established
    pub resyncs: Arc<AtomicU64>,
}

impl LiveProjectorStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running projector.
pub struct LiveProjectorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stats: LiveProjectorStats,
}

impl LiveProjectorHandle {
    /// Signal the projector to stop without waiting for it.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stop the projector and wait for its task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Live projector task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stats(&self) -> &LiveProjectorStats {
        &self.stats
    }
}

/// Keeps a projection current from the backend feed.
///
/// Each cycle subscribes first and then rebuilds, so nothing appended between
/// the two is missed; events the rebuild already covered arrive again on the
/// feed and are skipped as duplicates. A lagged receiver, a gap in a stream, or
/// a closed feed ends the cycle and, after the backoff, starts a new one.
pub struct LiveProjector {
    projection: Arc<Projection>,
    log: Arc<dyn EventLog>,
    reconnect_backoff: Duration,
}

impl LiveProjector {
    pub fn new(projection: Arc<Projection>, log: Arc<dyn EventLog>) -> Self {
        Self {
            projection,
            log,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Spawn the projector on the current tokio runtime.
    pub fn start(self) -> LiveProjectorHandle {
        let cancel = CancellationToken::new();
        let stats = LiveProjectorStats::default();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let stats = stats.clone();
            async move { self.run(cancel, stats).await }
        });

        LiveProjectorHandle { cancel, task, stats }
    }

    async fn run(self, cancel: CancellationToken, stats: LiveProjectorStats) {
        info!(backend = self.log.name(), "Live projector started");

        while !cancel.is_cancelled() {
            let Some(mut feed) = self.log.subscribe_all() else {
                warn!(
                    backend = self.log.name(),
                    "Event log has no live feed; projection refreshes only on rebuild"
                );
                return;
            };

            if let Err(e) = self.projection.rebuild(self.log.as_ref()).await {
                warn!(error = %e, "Live projector rebuild failed, retrying");
                if !self.pause(&cancel).await {
                    break;
                }
                continue;
            }
            stats.syncs.fetch_add(1, Ordering::Relaxed);

            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("Live projector stopped");
                        return;
                    }
                    received = feed.recv() => received,
                };

                match received {
                    Ok(record) => match self.projection.apply_event(&record) {
                        ApplyOutcome::Applied => {
                            stats.applied.fetch_add(1, Ordering::Relaxed);
                        }
                        ApplyOutcome::Duplicate => {}
                        ApplyOutcome::Gap { expected, found } => {
                            warn!(
                                stream = %record.stream_id,
                                expected,
                                found,
                                "Gap in live feed, resynchronising"
                            );
                            break;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Live projector lagged behind the feed, resynchronising");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Live feed closed, reconnecting");
                        break;
                    }
                }
            }

            stats.resyncs.fetch_add(1, Ordering::Relaxed);
            counter!(names::PROJECTION_RESYNCS_TOTAL).increment(1);
            if !self.pause(&cancel).await {
                break;
            }
        }

        info!("Live projector stopped");
    }

    /// Wait out the reconnect backoff. Returns `false` if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        debug!(backoff_ms = self.reconnect_backoff.as_millis() as u64, "Live projector backing off");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.reconnect_backoff) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ConfigEvent;
    use crate::projection::ConsistencyPolicy;
    use crate::store::{ExpectedVersion, InMemoryEventLog};

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_feed_events_reach_projection() {
        let log = Arc::new(InMemoryEventLog::new());
        log.append(&"a".into(), ExpectedVersion::Any, vec![ConfigEvent::value_set("a", "1", None)])
            .await
            .unwrap();

        let projection = Arc::new(Projection::new(ConsistencyPolicy::Live));
        let handle = LiveProjector::new(projection.clone(), log.clone())
            .with_reconnect_backoff(Duration::from_millis(10))
            .start();

        wait_for(|| handle.stats().syncs() >= 1).await;
        assert_eq!(projection.get("a").as_deref(), Some("1"));

        log.append(&"b".into(), ExpectedVersion::Any, vec![ConfigEvent::value_set("b", "2", None)])
            .await
            .unwrap();
        wait_for(|| projection.get("b").is_some()).await;

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_feed_closes() {
        let log = Arc::new(InMemoryEventLog::new());
        let projection = Arc::new(Projection::default());
        let handle = LiveProjector::new(projection.clone(), log.clone())
            .with_reconnect_backoff(Duration::from_millis(10))
            .start();
        wait_for(|| handle.stats().syncs() >= 1).await;

        log.disconnect_subscribers();
        wait_for(|| handle.stats().syncs() >= 2).await;
        assert!(handle.stats().resyncs() >= 1);

        log.append(&"c".into(), ExpectedVersion::Any, vec![ConfigEvent::value_set("c", "3", None)])
            .await
            .unwrap();
        wait_for(|| projection.get("c").is_some()).await;

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let log = Arc::new(InMemoryEventLog::new());
        let handle = LiveProjector::new(Arc::new(Projection::default()), log).start();
        wait_for(|| handle.stats().syncs() >= 1).await;

        handle.shutdown();
        wait_for(|| handle.is_finished()).await;
    }
}
