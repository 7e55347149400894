use thiserror::Error;

use super::state::SyncState;
use crate::state::StateError;
use crate::storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync transition {from} -> {to}")]
    InvalidTransition { from: SyncState, to: SyncState },

    /// All attempts of a sync cycle failed.
    #[error("sync failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for ledger operations.
pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The ledger could not be read or written.
    #[error("ledger state error: {0}")]
    State(#[from] StateError),
}
