//! Failed-sync ledger.
//!
//! When a sync cycle exhausts its retries the failure is written to durable
//! actor state under `failedSync`. The next session start replays it before
//! restoring the workspace, so a sandbox that survived the outage gets its
//! unsynced changes copied out. Only metadata is stored.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::SyncTarget;
use super::error::RecoveryResult;
use crate::state::{FAILED_SYNC_KEY, SessionState};

/// Ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedSync {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub last_error: String,
    pub attempt_count: u32,
    #[serde(default)]
    pub affected_paths: Vec<String>,
}

/// What [`RecoveryLedger::attempt_recovery`] found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// No failure recorded.
    NoFailure,
    /// The entry belonged to another session and was discarded.
    StaleDiscarded,
    /// The sandbox no longer holds the data; entry discarded.
    SourceMissing,
    /// Copy succeeded and the entry was cleared.
    Recovered,
    /// Copy failed again; entry kept with an incremented attempt count.
    StillFailing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub recovered: bool,
    pub status: RecoveryStatus,
    pub error: Option<String>,
}

impl RecoveryReport {
    fn new(status: RecoveryStatus) -> Self {
        Self {
            recovered: status == RecoveryStatus::Recovered,
            status,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            recovered: false,
            status: RecoveryStatus::StillFailing,
            error: Some(error),
        }
    }
}

/// Reads and writes the `failedSync` entry of one session.
#[derive(Clone)]
pub struct RecoveryLedger {
    state: SessionState,
}

impl RecoveryLedger {
    pub fn new(state: SessionState) -> Self {
        Self { state }
    }

    /// Record a failure. Repeated failures for the same session bump the
    /// attempt count; the first one starts at 1.
    pub async fn record_failure(
        &self,
        session_id: &str,
        error: &str,
        affected_paths: Vec<String>,
    ) -> RecoveryResult<FailedSync> {
        let entry = match self.get_failed_sync().await? {
            Some(mut existing) if existing.session_id == session_id => {
                existing.attempt_count += 1;
                existing.last_error = error.to_string();
                existing.timestamp = Utc::now();
                for path in affected_paths {
                    if !existing.affected_paths.contains(&path) {
                        existing.affected_paths.push(path);
                    }
                }
                existing
            }
            _ => FailedSync {
                session_id: session_id.to_string(),
                timestamp: Utc::now(),
                last_error: error.to_string(),
                attempt_count: 1,
                affected_paths,
            },
        };

        self.state.save(FAILED_SYNC_KEY, &entry).await?;
        warn!(
            "Recorded failed sync for {} (attempt {}): {}",
            session_id, entry.attempt_count, entry.last_error
        );
        Ok(entry)
    }

    pub async fn get_failed_sync(&self) -> RecoveryResult<Option<FailedSync>> {
        Ok(self.state.load(FAILED_SYNC_KEY).await?)
    }

    pub async fn clear_failed_sync(&self) -> RecoveryResult<()> {
        Ok(self.state.remove(FAILED_SYNC_KEY).await?)
    }

    /// Replay a recorded failure against `target`.
    pub async fn attempt_recovery(
        &self,
        target: &dyn SyncTarget,
        session_id: &str,
    ) -> RecoveryResult<RecoveryReport> {
        let Some(entry) = self.get_failed_sync().await? else {
            return Ok(RecoveryReport::new(RecoveryStatus::NoFailure));
        };

        if entry.session_id != session_id {
            info!(
                "Discarding stale failed-sync entry for {} in session {}",
                entry.session_id, session_id
            );
            self.clear_failed_sync().await?;
            return Ok(RecoveryReport::new(RecoveryStatus::StaleDiscarded));
        }

        match target.source_exists().await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "Workspace for {} is gone, nothing to recover ({} prior attempts)",
                    session_id, entry.attempt_count
                );
                self.clear_failed_sync().await?;
                return Ok(RecoveryReport::new(RecoveryStatus::SourceMissing));
            }
            Err(e) => {
                let error = format!("checking workspace: {e}");
                self.record_failure(session_id, &error, Vec::new()).await?;
                return Ok(RecoveryReport::failed(error));
            }
        }

        let error = match target.copy_to().await {
            Ok(status) if status.is_success() => {
                self.clear_failed_sync().await?;
                info!(
                    "Recovered failed sync for {} after {} attempts",
                    session_id, entry.attempt_count
                );
                return Ok(RecoveryReport::new(RecoveryStatus::Recovered));
            }
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };

        self.record_failure(session_id, &error, Vec::new()).await?;
        Ok(RecoveryReport::failed(error))
    }
}
