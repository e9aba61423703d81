//! Error types for prgate-ledger

use thiserror::Error;

/// Errors that can occur in the run ledger
#[derive(Error, Debug)]
pub enum StorageError {
    /// Run does not exist
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state required by the operation
    #[error("Run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Digest string is not 64 hex characters
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Event sequence number did not advance
    #[error("Event seq {seq} for run {run_id} is not greater than {last}")]
    NonMonotonicSeq { run_id: String, seq: u64, last: u64 },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A writer panicked while holding the ledger lock
    #[error("Ledger lock poisoned")]
    LockPoisoned,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
