//! Append-only, hash-chained audit ledger
//!
//! Every state change of a tracked business entity is recorded as an
//! [`AuditEntry`] in that entity's own chain. Each entry commits to its
//! predecessor through `prev_hash`, so rewriting any stored entry is
//! detected by [`AuditLedger::verify_chain`].
//!
//! Backends:
//! - [`InMemoryAuditLedger`] for tests and single-process use
//! - `PostgresAuditLedger` (feature `postgres`) for shared deployments

#![deny(unsafe_code)]

pub mod chain;
pub mod error;
pub mod memory;
pub mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;

pub use chain::{compute_entry_hash, verify_entries, GENESIS_HASH};
pub use error::{LedgerError, LedgerResult};
pub use memory::InMemoryAuditLedger;
pub use model::{ActionType, AuditAppend, AuditEntry, ChainVerification, EntityKey};
#[cfg(feature = "postgres")]
pub use postgres::PostgresAuditLedger;
pub use traits::AuditLedger;
