//! Storage error types.

use thiserror::Error;

use crate::sandbox::SandboxError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that prevent a storage operation from producing a status at all.
///
/// Expected outcomes such as "nothing to copy" or a failed rsync are reported
/// through [`super::CopyToStatus`] / [`super::CopyFromStatus`] instead.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Mounting the durable storage failed.
    #[error("mount of {bucket} at {path} failed (code {code:?}): {message}")]
    Mount {
        bucket: String,
        path: String,
        code: Option<i32>,
        message: String,
    },

    /// A storage command exited unsuccessfully.
    #[error("{operation} failed: {message}")]
    Command {
        operation: &'static str,
        message: String,
    },

    /// Invalid path or session id.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The sandbox could not run the storage command.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}
