//! Sync lifecycle states and the transitions allowed between them.

use std::fmt;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use super::error::SyncError;

/// Sync lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    /// A debounce window is open or a cycle is about to start.
    Pending,
    Syncing,
    /// Copy succeeded; flushing the durable mount.
    Flushing,
    /// Waiting to retry a failed copy.
    Retrying,
    /// Retries exhausted; left immediately for `Idle`.
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Flushing => "flushing",
            Self::Retrying => "retrying",
            Self::Error => "error",
        }
    }

    /// Whether `self -> to` is in the transition table.
    pub fn can_transition_to(self, to: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, to),
            (Idle, Pending)
                | (Pending, Syncing)
                | (Pending, Idle)
                | (Syncing, Flushing)
                | (Syncing, Retrying)
                | (Syncing, Error)
                | (Flushing, Idle)
                | (Flushing, Pending)
                | (Flushing, Retrying)
                | (Flushing, Error)
                | (Retrying, Syncing)
                | (Retrying, Error)
                | (Error, Idle)
        )
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a session's sync lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncContext {
    pub state: SyncState,
    /// Requests waiting for the next cycle.
    pub pending_count: u32,
    /// Retries made by the current cycle.
    pub retry_count: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncContext {
    /// Move to `to` if the table allows it. Rejected transitions are logged
    /// and leave the state unchanged.
    pub fn transition(&mut self, to: SyncState) -> Result<(), SyncError> {
        if self.state.can_transition_to(to) {
            self.state = to;
            Ok(())
        } else {
            warn!("Rejected sync transition {} -> {}", self.state, to);
            Err(SyncError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}
