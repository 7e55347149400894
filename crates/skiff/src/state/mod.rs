//! Durable per-session actor state.
//!
//! Small JSON documents keyed by `(session_id, key)` that must outlive the
//! actor instance: pending interactions and the failed-sync ledger. Values are
//! overwritten wholesale on every mutation.
//!
//! Implementations:
//! - [`FileStateStore`]: one file per key under `{base}/{session_id}/`
//! - [`MemoryStateStore`]: in-process map (tests, ephemeral deployments)

mod error;
mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use error::{StateError, StateResult};
pub use file::FileStateStore;
pub use memory::MemoryStateStore;

/// Key holding unresolved permission requests.
pub const PENDING_PERMISSIONS_KEY: &str = "pendingPermissions";
/// Key holding unresolved questions.
pub const PENDING_QUESTIONS_KEY: &str = "pendingQuestions";
/// Key holding the failed-sync ledger entry.
pub const FAILED_SYNC_KEY: &str = "failedSync";

/// Key/value storage scoped by session id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a value; `None` if the key was never written or was deleted.
    async fn get(&self, session_id: &str, key: &str) -> StateResult<Option<Value>>;

    /// Overwrite a value.
    async fn put(&self, session_id: &str, key: &str, value: &Value) -> StateResult<()>;

    /// Remove a value. Removing a missing key is not an error.
    async fn delete(&self, session_id: &str, key: &str) -> StateResult<()>;
}

/// A [`StateStore`] bound to one session, with typed accessors.
#[derive(Clone)]
pub struct SessionState {
    store: Arc<dyn StateStore>,
    session_id: String,
}

impl SessionState {
    pub fn new(store: Arc<dyn StateStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Load and decode a value.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        match self.store.get(&self.session_id, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Encode and store a value.
    pub async fn save<T: Serialize>(&self, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_value(value)?;
        self.store.put(&self.session_id, key, &value).await
    }

    pub async fn remove(&self, key: &str) -> StateResult<()> {
        self.store.delete(&self.session_id, key).await
    }
}

/// State store configuration.
#[derive(Debug, Clone)]
pub enum StateStoreConfig {
    /// JSON files below a directory.
    File(std::path::PathBuf),
    /// Process memory only.
    Memory,
}

/// Create a state store based on configuration.
pub fn create_state_store(config: StateStoreConfig) -> Arc<dyn StateStore> {
    match config {
        StateStoreConfig::File(path) => Arc::new(FileStateStore::new(path)),
        StateStoreConfig::Memory => Arc::new(MemoryStateStore::new()),
    }
}

/// Reject anything that could escape the session directory.
pub(crate) fn validate_component(component: &str) -> StateResult<()> {
    let valid = !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidKey(component.to_string()))
    }
}
