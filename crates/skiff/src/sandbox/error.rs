use std::time::Duration;

use thiserror::Error;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox could not be created or prepared.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// The agent channel is missing, closed or broken.
    #[error("connection error: {0}")]
    Connection(String),

    /// A shell command could not be run.
    #[error("exec of `{command}` failed: {message}")]
    Exec { command: String, message: String },

    /// An operation did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
