//! Event Sourcing Primitives
//!
//! - **`event`**: The `ConfigEvent` sum type, recorded-event envelope and identifiers.
//! - **`aggregate`**: The `Aggregate` trait and `ConfigAggregate`, which validates
//!   commands and is rebuilt by replaying a key's stream.

pub mod aggregate;
pub mod event;

pub use aggregate::*;
pub use event::*;
