//! Aggregate trait and the config-key aggregate.
//!
//! Aggregates are domain objects rebuilt from a stream of events. Each
//! aggregate implements `Default` (empty state) and `apply` (fold an event).
//! `ConfigAggregate` additionally turns commands into events, enforcing the
//! business rules for a single config key.

use serde::{Deserialize, Serialize};

use crate::error::{ConfStoreError, Result};

use super::event::ConfigEvent;

// =============================================================================
// Aggregate Trait
// =============================================================================

/// Trait for aggregates that can be reconstructed from a sequence of events.
///
/// An aggregate starts at its `Default` state and folds each event via `apply`.
/// Given the same event stream in the same order, the resulting state is
/// always the same.
pub trait Aggregate: Default {
    /// Apply a single event to mutate state.
    ///
    /// Implementations must be pure functions of `(self, event) -> self'`.
    /// They must not perform I/O or fail: every persisted event is valid by
    /// definition.
    fn apply(&mut self, event: &ConfigEvent);

    /// Left fold of `apply` starting from the empty state.
    ///
    /// Events must be passed in the order the event log returned them.
    fn replay<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a ConfigEvent>,
    {
        let mut aggregate = Self::default();
        for event in events {
            aggregate.apply(event);
        }
        aggregate
    }
}

// =============================================================================
// Config Aggregate
// =============================================================================

/// Reconstructed state of one config key.
///
/// Deletion leaves `current_value` in place as a tombstone so that a later
/// write can record the correct `previous_value` lineage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAggregate {
    pub key: Option<String>,
    pub current_value: Option<String>,
    /// Number of events applied (the stream version).
    pub version: u64,
    pub deleted: bool,
}

impl ConfigAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command: write `value` under `key`.
    ///
    /// Succeeds on a deleted aggregate as well; deletion is not a permanent
    /// lock on the key.
    pub fn set_value(&self, key: &str, value: &str) -> Result<(ConfigEvent, ConfigAggregate)> {
        validate_key(key)?;
        validate_value(value)?;

        let event = ConfigEvent::value_set(key, value, self.current_value.clone());
        let mut next = self.clone();
        next.apply(&event);
        Ok((event, next))
    }

    /// Command: delete the value under `key`.
    pub fn delete_value(&self, key: &str) -> Result<(ConfigEvent, ConfigAggregate)> {
        if self.version == 0 {
            return Err(ConfStoreError::not_found(key));
        }
        if self.deleted {
            return Err(ConfStoreError::already_deleted(key));
        }
        let deleted_value = self.current_value.clone().ok_or_else(|| {
            ConfStoreError::internal(format!(
                "aggregate for {} at version {} has no value",
                key, self.version
            ))
        })?;

        let event = ConfigEvent::value_deleted(key, deleted_value);
        let mut next = self.clone();
        next.apply(&event);
        Ok((event, next))
    }

    /// The live value, or `None` when the key was never written or is deleted.
    pub fn current_value(&self) -> Option<&str> {
        if self.exists() {
            self.current_value.as_deref()
        } else {
            None
        }
    }

    pub fn exists(&self) -> bool {
        self.version > 0 && !self.deleted
    }
}

impl Aggregate for ConfigAggregate {
    fn apply(&mut self, event: &ConfigEvent) {
        self.version += 1;

        match event {
            ConfigEvent::ValueSet(e) => {
                self.key = Some(e.key.clone());
                self.current_value = Some(e.value.clone());
                self.deleted = false;
            }
            ConfigEvent::ValueDeleted(e) => {
                self.key = Some(e.key.clone());
                self.deleted = true;
            }
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(ConfStoreError::invalid_input("config key must not be empty"));
    }
    if key.chars().any(char::is_control) {
        return Err(ConfStoreError::invalid_input(
            "config key must not contain control characters",
        )
        .with_key(key));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(ConfStoreError::invalid_input("config value must not contain NUL"));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
