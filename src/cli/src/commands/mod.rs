//! Subcommand implementations.

pub mod history;
pub mod keys;
