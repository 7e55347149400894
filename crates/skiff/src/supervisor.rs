//! Supervised background tasks.
//!
//! Work that must finish even when the foreground interaction is already done
//! (persistence drains, disconnect syncs, sync follow-ups) is spawned here
//! instead of with a bare `tokio::spawn`, so shutdown can wait for it.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Tracks background tasks and joins them on shutdown.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task. `name` appears in logs when the task panics.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = self.tracker.spawn(future);
        self.tracker.spawn(async move {
            if let Err(e) = inner.await
                && e.is_panic()
            {
                warn!("Supervised task '{}' panicked: {}", name, e);
            }
        })
    }

    /// Token cancelled when shutdown begins. Long-running tasks select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of live tracked tasks (each spawn counts its watcher too).
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Signal shutdown, stop accepting work and wait for running tasks.
    ///
    /// Returns `false` if tasks were still running when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        debug!("Waiting for {} supervised tasks", self.tracker.len());
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "Timed out after {:?} waiting for {} supervised tasks",
                    timeout,
                    self.tracker.len()
                );
                false
            }
        }
    }
}
