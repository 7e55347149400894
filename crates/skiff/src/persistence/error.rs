//! Persistence error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for record store operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors from writing conversation records.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The record store answered with a non-success status.
    #[error("record store returned {status}: {message}")]
    Status { status: StatusCode, message: String },

    /// The request timed out.
    #[error("record store request timed out")]
    Timeout,

    /// The record store could not be reached.
    #[error("failed to connect to record store at {url}: {message}")]
    Connection { url: String, message: String },

    /// The response body could not be decoded.
    #[error("failed to parse record store response: {0}")]
    Decode(String),

    /// Any other request failure.
    #[error("record store request failed: {0}")]
    Request(String),
}

impl PersistenceError {
    /// Whether a later attempt may succeed.
    ///
    /// Server errors, 408, 429, timeouts and connection failures are
    /// transient; validation and not-found style failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Timeout | Self::Connection { .. } => true,
            Self::Decode(_) | Self::Request(_) => false,
        }
    }
}

impl From<reqwest::Error> for PersistenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connection {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}
