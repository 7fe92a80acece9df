//! Outbound audit notifications.
//!
//! After every successful append the facade hands an [`AuditRecord`] to the
//! [`AuditPublisher`]. Records travel over a bounded channel to whatever
//! collaborator owns the receiving half. Publishing never blocks and never
//! fails a command: a full or closed channel is logged and counted.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{ConfigEvent, RecordedEvent};
use crate::telemetry::metrics as names;

/// One audit notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub event_type: &'static str,
    pub key: String,
    pub stream_version: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: ConfigEvent,
}

impl From<&RecordedEvent> for AuditRecord {
    fn from(record: &RecordedEvent) -> Self {
        Self {
            event_type: record.event_type(),
            key: record.stream_id.to_string(),
            stream_version: record.stream_version,
            recorded_at: record.recorded_at,
            event: record.event.clone(),
        }
    }
}

/// Sending half of the audit channel.
#[derive(Debug, Clone)]
pub struct AuditPublisher {
    sender: Option<mpsc::Sender<AuditRecord>>,
}

impl AuditPublisher {
    /// Create a publisher and the receiver the audit collaborator consumes.
    pub fn channel(buffer_size: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        (Self { sender: Some(sender) }, receiver)
    }

    /// A publisher that discards every record.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Publish one record per recorded event. Returns how many were delivered.
    pub fn publish(&self, records: &[RecordedEvent]) -> usize {
        let Some(sender) = &self.sender else {
            return 0;
        };

        let mut delivered = 0;
        for record in records {
            match sender.try_send(AuditRecord::from(record)) {
                Ok(()) => {
                    delivered += 1;
                    counter!(names::AUDIT_PUBLISHED_TOTAL).increment(1);
                }
                Err(mpsc::error::TrySendError::Full(audit)) => {
                    warn!(
                        key = %audit.key,
                        stream_version = audit.stream_version,
                        "Audit channel full, record dropped"
                    );
                    counter!(names::AUDIT_DROPPED_TOTAL, "reason" => "full").increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(audit)) => {
                    warn!(
                        key = %audit.key,
                        stream_version = audit.stream_version,
                        "Audit channel closed, record dropped"
                    );
                    counter!(names::AUDIT_DROPPED_TOTAL, "reason" => "closed").increment(1);
                }
            }
        }
        debug!(delivered, total = records.len(), "Audit records published");
        delivered
    }
}

impl Default for AuditPublisher {
    fn default() -> Self {
        Self::disabled()
    }
}
