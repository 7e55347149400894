//! In-memory actor state.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{StateResult, StateStore};

/// Process-local state store. Survives actor restarts but not process exits.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: DashMap<(String, String), Value>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys across all sessions.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, session_id: &str, key: &str) -> StateResult<Option<Value>> {
        Ok(self
            .values
            .get(&(session_id.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn put(&self, session_id: &str, key: &str, value: &Value) -> StateResult<()> {
        self.values
            .insert((session_id.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str, key: &str) -> StateResult<()> {
        self.values
            .remove(&(session_id.to_string(), key.to_string()));
        Ok(())
    }
}
