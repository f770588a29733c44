//! Workflow instance and definition persistence.
//!
//! The instance store is the only place instance state changes, and the only
//! way to change it is [`InstanceStore::compare_and_swap`]. It also owns the
//! "one Active instance per `(definition, entity)`" rule, so the rule holds
//! for concurrent starts from any number of processes sharing a backend.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use memory::InMemoryInstanceStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresWorkflowStore;
pub use traits::{ActiveKey, DefinitionStore, InstanceStore};
