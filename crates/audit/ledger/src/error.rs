use thiserror::Error;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Audit ledger errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("correction references seq {seq}, but the chain head is seq {head}")]
    InvalidCorrection { seq: u64, head: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}
