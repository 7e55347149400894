//! Session error types.

use thiserror::Error;

use crate::sandbox::SandboxError;
use crate::state::StateError;
use crate::storage::StorageError;
use crate::sync::RecoveryError;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The sandbox could not be provisioned or prepared.
    #[error("provisioning failed: {0}")]
    Provisioning(#[source] SandboxError),

    /// The agent channel is missing or broken.
    #[error("not connected to sandbox")]
    NotConnected,

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Malformed or out-of-place browser message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("session actor has shut down")]
    ActorShutdown,
}

impl SessionError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
