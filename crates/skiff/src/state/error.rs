//! Durable actor state error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for actor state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by a [`StateStore`](super::StateStore).
#[derive(Debug, Error)]
pub enum StateError {
    /// Session id or key cannot be used as a storage path component.
    #[error("invalid state key: {0}")]
    InvalidKey(String),

    /// IO error on a state file.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}
