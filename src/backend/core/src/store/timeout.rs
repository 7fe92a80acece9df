//! Deadline decorator for event log backends.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use super::{AppendAck, EventLog, ExpectedVersion, StoreError};
use crate::events::{ConfigEvent, RecordedEvent, StreamId};

/// Wraps another backend and fails any call that does not finish within
/// `timeout` with `StoreError::Unavailable`. Calls are never retried here.
pub struct TimeoutEventLog {
    inner: Arc<dyn EventLog>,
    timeout: Duration,
}

impl TimeoutEventLog {
    pub fn new(inner: Arc<dyn EventLog>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    backend = self.inner.name(),
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Event log call timed out"
                );
                Err(StoreError::Unavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl EventLog for TimeoutEventLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected: ExpectedVersion,
        events: Vec<ConfigEvent>,
    ) -> Result<AppendAck, StoreError> {
        self.bounded("append", self.inner.append(stream, expected, events))
            .await
    }

    async fn read_forward(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        self.bounded("read_forward", self.inner.read_forward(stream)).await
    }

    async fn read_all_forward(&self) -> Result<Vec<RecordedEvent>, StoreError> {
        self.bounded("read_all_forward", self.inner.read_all_forward())
            .await
    }

    fn subscribe_all(&self) -> Option<broadcast::Receiver<RecordedEvent>> {
        self.inner.subscribe_all()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventLog;

    /// Backend whose calls never complete.
    struct StalledLog;

    #[async_trait]
    impl EventLog for StalledLog {
        async fn append(
            &self,
            _stream: &StreamId,
            _expected: ExpectedVersion,
            _events: Vec<ConfigEvent>,
        ) -> Result<AppendAck, StoreError> {
            std::future::pending().await
        }

        async fn read_forward(&self, _stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
            std::future::pending().await
        }

        async fn read_all_forward(&self) -> Result<Vec<RecordedEvent>, StoreError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_stalled_call_becomes_unavailable() {
        let log = TimeoutEventLog::new(Arc::new(StalledLog), Duration::from_millis(50));

        let err = log.read_forward(&"a".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        let err = log
            .append(&"a".into(), ExpectedVersion::Any, vec![ConfigEvent::value_set("a", "1", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let log = TimeoutEventLog::new(Arc::new(InMemoryEventLog::new()), Duration::from_secs(1));
        log.append(&"a".into(), ExpectedVersion::Exact(0), vec![ConfigEvent::value_set("a", "1", None)])
            .await
            .unwrap();

        assert_eq!(log.read_forward(&"a".into()).await.unwrap().len(), 1);
        assert_eq!(log.name(), "memory");
        assert!(log.subscribe_all().is_some());
    }
}
