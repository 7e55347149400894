//! Workspace synchronization to durable storage.
//!
//! - [`state`]: lifecycle states and the allowed transitions
//! - [`recovery`]: crash-safe ledger of failed syncs
//! - [`manager`]: debounced, retried, one-at-a-time sync execution

mod error;
pub mod manager;
pub mod recovery;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;

use crate::sandbox::Sandbox;
use crate::storage::{CopyToStatus, StorageResult, WorkspaceStorage};

pub use error::{RecoveryError, RecoveryResult, SyncError, SyncResult};
pub use manager::{SyncConfig, SyncManager, SyncOutcome, SyncWaiter};
pub use recovery::{FailedSync, RecoveryLedger, RecoveryReport, RecoveryStatus};
pub use state::{SyncContext, SyncState};

/// Something whose contents can be copied to durable storage.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    async fn copy_to(&self) -> StorageResult<CopyToStatus>;

    /// Best-effort flush after a successful copy.
    async fn flush(&self) -> StorageResult<()>;

    /// Whether the data to copy still exists.
    async fn source_exists(&self) -> StorageResult<bool>;

    /// Path recorded in the failed-sync ledger.
    fn source_path(&self) -> String;
}

/// A session's sandbox workspace bound to its durable storage.
#[derive(Clone)]
pub struct SandboxSyncTarget {
    storage: Arc<dyn WorkspaceStorage>,
    sandbox: Arc<dyn Sandbox>,
    session_id: String,
}

impl SandboxSyncTarget {
    pub fn new(
        storage: Arc<dyn WorkspaceStorage>,
        sandbox: Arc<dyn Sandbox>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            sandbox,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl SyncTarget for SandboxSyncTarget {
    async fn copy_to(&self) -> StorageResult<CopyToStatus> {
        self.storage
            .copy_to(self.sandbox.as_ref(), &self.session_id)
            .await
    }

    async fn flush(&self) -> StorageResult<()> {
        self.storage.flush(self.sandbox.as_ref()).await
    }

    async fn source_exists(&self) -> StorageResult<bool> {
        self.storage.source_exists(self.sandbox.as_ref()).await
    }

    fn source_path(&self) -> String {
        self.sandbox.workdir().to_string()
    }
}
