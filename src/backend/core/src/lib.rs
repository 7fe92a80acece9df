#![allow(clippy::result_large_err)]
//! # Confstore Core
//!
//! Event-sourced configuration key/value store.
//!
//! ## Architecture
//!
//! - **Events**: the closed set of config events and the aggregate that decides them
//! - **Store**: the append-only event log trait with in-memory, file, and deadline backends
//! - **Projection**: the rebuildable read model, kept live from the backend feed or
//!   refreshed only on rebuild
//! - **Service**: the CQRS facade (`put`, `delete`, `get`, `all`, `history`, `at`)
//! - **Audit**: outbound notifications for every committed event
//! - **Telemetry**: structured logging and metrics

pub mod audit;
pub mod config;
pub mod error;
pub mod events;
pub mod projection;
pub mod service;
pub mod store;
pub mod telemetry;

pub use error::{ConfStoreError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditPublisher, AuditRecord};
    pub use crate::config::{BackendKind, Config, LimitsConfig};
    pub use crate::error::{ConfStoreError, ErrorCode, ErrorSeverity, Result};
    pub use crate::events::{
        Aggregate, ConfigAggregate, ConfigEvent, EventId, RecordedEvent, StreamId,
    };
    pub use crate::projection::{
        ApplyOutcome, ConfigEntry, ConsistencyPolicy, LiveProjector, LiveProjectorHandle,
        Projection, ProjectionStats,
    };
    pub use crate::service::{ConfigService, HistoryEntry};
    pub use crate::store::{
        AppendAck, EventLog, ExpectedVersion, FileEventLog, FileEventLogConfig,
        InMemoryEventLog, StoreError, TimeoutEventLog,
    };
}
