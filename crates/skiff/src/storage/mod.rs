//! Durable workspace storage.
//!
//! The sandbox working directory is mirrored to a durable mount (object
//! storage exposed as a filesystem) under `{mount_path}/sessions/{session_id}/`.
//! All operations run inside the sandbox, so the trait takes the sandbox the
//! workspace lives in.
//!
//! Implementations:
//! - [`RsyncStorage`]: `rsync` through `Sandbox::exec`, with a file-count
//!   verification pass after every copy

mod error;
mod rsync;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sandbox::Sandbox;

pub use error::{StorageError, StorageResult};
pub use rsync::{RsyncStorage, RsyncStorageConfig};

/// Outcome of copying the workspace to durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum CopyToStatus {
    Synced,
    /// The workspace is missing or empty; nothing to copy.
    NoLocalData,
    RsyncFailed(String),
    VerifyFailed(String),
}

impl CopyToStatus {
    /// Whether the attempt counts as a successful sync.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synced | Self::NoLocalData)
    }
}

impl fmt::Display for CopyToStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synced => write!(f, "synced"),
            Self::NoLocalData => write!(f, "no-local-data"),
            Self::RsyncFailed(detail) => write!(f, "rsync-failed: {detail}"),
            Self::VerifyFailed(detail) => write!(f, "verify-failed: {detail}"),
        }
    }
}

/// Outcome of restoring the workspace from durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum CopyFromStatus {
    Restored,
    /// Nothing stored for this session yet.
    NoRemoteData,
    RsyncFailed(String),
    VerifyFailed(String),
}

impl fmt::Display for CopyFromStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restored => write!(f, "restored"),
            Self::NoRemoteData => write!(f, "no-remote-data"),
            Self::RsyncFailed(detail) => write!(f, "rsync-failed: {detail}"),
            Self::VerifyFailed(detail) => write!(f, "verify-failed: {detail}"),
        }
    }
}

/// Parameters for mounting durable storage inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub bucket: String,
    pub mount_path: String,
    /// Environment variables carrying credentials for the mount helper.
    pub credentials: HashMap<String, String>,
}

/// Durable storage for sandbox working directories.
#[async_trait]
pub trait WorkspaceStorage: Send + Sync {
    /// Attach durable storage to the sandbox.
    async fn mount(&self, sandbox: &dyn Sandbox, options: &MountOptions) -> StorageResult<()>;

    /// Copy the sandbox working directory to durable storage.
    async fn copy_to(&self, sandbox: &dyn Sandbox, session_id: &str)
    -> StorageResult<CopyToStatus>;

    /// Restore the sandbox working directory from durable storage.
    async fn copy_from(
        &self,
        sandbox: &dyn Sandbox,
        session_id: &str,
    ) -> StorageResult<CopyFromStatus>;

    /// Flush filesystem buffers of the durable mount.
    async fn flush(&self, sandbox: &dyn Sandbox) -> StorageResult<()>;

    /// Whether the sandbox still holds the working directory.
    async fn source_exists(&self, sandbox: &dyn Sandbox) -> StorageResult<bool>;
}

/// Quote a string for POSIX `sh`.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
