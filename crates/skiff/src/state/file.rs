//! File-backed actor state.
//!
//! Layout: `{base}/{session_id}/{key}.json`. Writes go to a temp file first
//! and are renamed into place so a crash never leaves a half-written value.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::fs;

use super::{StateError, StateResult, StateStore, validate_component};

/// Local filesystem state store.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    base_path: PathBuf,
}

impl FileStateStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_path(&self, session_id: &str, key: &str) -> StateResult<PathBuf> {
        validate_component(session_id)?;
        validate_component(key)?;
        Ok(self
            .base_path
            .join(session_id)
            .join(format!("{key}.json")))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, session_id: &str, key: &str) -> StateResult<Option<Value>> {
        let path = self.key_path(session_id, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::io(path, e)),
        }
    }

    async fn put(&self, session_id: &str, key: &str, value: &Value) -> StateResult<()> {
        let path = self.key_path(session_id, key)?;
        let session_dir = self.base_path.join(session_id);
        fs::create_dir_all(&session_dir)
            .await
            .map_err(|e| StateError::io(&session_dir, e))?;

        let temp_path = session_dir.join(format!("{key}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| StateError::io(&temp_path, e))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::io(&path, e))?;

        debug!("Wrote state {} for session {}", key, session_id);
        Ok(())
    }

    async fn delete(&self, session_id: &str, key: &str) -> StateResult<()> {
        let path = self.key_path(session_id, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted state {} for session {}", key, session_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(path, e)),
        }
    }
}
