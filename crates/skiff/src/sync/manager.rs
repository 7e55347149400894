//! Debounced, retried workspace sync.
//!
//! Requests open a debounce window: the first request arms a `debounce`
//! timer (capped at `max_debounce`) and later requests join the window
//! without moving its deadline. When the window closes one physical sync
//! runs. Requests arriving while a sync is running are coalesced into a
//! single follow-up cycle.
//!
//! All bookkeeping lives behind one `std::sync::Mutex` that is never held
//! across an await. The `running` flag inside it guarantees that at most one
//! copy executes at a time.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::SyncError;
use super::recovery::RecoveryLedger;
use super::state::{SyncContext, SyncState};
use super::SyncTarget;
use crate::retry::Backoff;
use crate::storage::CopyToStatus;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub debounce: Duration,
    /// Upper bound on how long a window may be extended.
    pub max_debounce: Duration,
    /// Copy attempts per cycle.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            max_debounce: Duration::from_secs(10),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// How a sync request was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    NoLocalData,
    /// Retries exhausted; carries the last error.
    Failed(String),
    /// The request was cancelled before a cycle started.
    Skipped,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synced | Self::NoLocalData)
    }
}

/// Resolves when the cycle covering a request completes.
#[derive(Debug)]
pub struct SyncWaiter {
    rx: oneshot::Receiver<SyncOutcome>,
}

impl SyncWaiter {
    fn channel() -> (Waiter, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for SyncWaiter {
    type Output = SyncOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(SyncOutcome::Skipped))
    }
}

type Waiter = oneshot::Sender<SyncOutcome>;

struct Window {
    generation: u64,
    deadline: Instant,
}

enum FollowUp {
    Debounce(u64),
    Run(Vec<Waiter>),
}

#[derive(Default)]
struct Inner {
    context: SyncContext,
    /// Waiters covered by the open window or the running cycle.
    waiters: Vec<Waiter>,
    /// Waiters that arrived while a cycle was running.
    next_waiters: Vec<Waiter>,
    window: Option<Window>,
    generation: u64,
    running: bool,
    /// A forced sync arrived while running; skip the follow-up debounce.
    force_next: bool,
}

impl Inner {
    fn transition(&mut self, to: SyncState) {
        // Rejections are logged by the context and leave the state as is.
        let _ = self.context.transition(to);
    }

    fn open_window(&mut self, config: &SyncConfig) -> u64 {
        self.generation += 1;
        self.window = Some(Window {
            generation: self.generation,
            deadline: Instant::now() + config.debounce.min(config.max_debounce),
        });
        self.generation
    }

    /// Mark a cycle as running and take the waiters it covers.
    fn claim(&mut self) -> Vec<Waiter> {
        self.running = true;
        self.transition(SyncState::Syncing);
        self.context.pending_count = 0;
        self.context.retry_count = 0;
        std::mem::take(&mut self.waiters)
    }

    fn follow_up(&mut self, config: &SyncConfig) -> Option<FollowUp> {
        if self.next_waiters.is_empty() {
            self.force_next = false;
            return None;
        }
        self.transition(SyncState::Pending);
        self.waiters = std::mem::take(&mut self.next_waiters);
        if std::mem::take(&mut self.force_next) {
            Some(FollowUp::Run(self.claim()))
        } else {
            Some(FollowUp::Debounce(self.open_window(config)))
        }
    }
}

struct Shared {
    session_id: String,
    target: Arc<dyn SyncTarget>,
    ledger: RecoveryLedger,
    config: SyncConfig,
    inner: Mutex<Inner>,
}

/// Per-session sync coordinator. Cheap to clone.
#[derive(Clone)]
pub struct SyncManager {
    shared: Arc<Shared>,
    supervisor: Supervisor,
}

impl SyncManager {
    pub fn new(
        session_id: impl Into<String>,
        target: Arc<dyn SyncTarget>,
        ledger: RecoveryLedger,
        config: SyncConfig,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                target,
                ledger,
                config,
                inner: Mutex::new(Inner::default()),
            }),
            supervisor,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the lifecycle state.
    pub fn context(&self) -> SyncContext {
        self.lock().context.clone()
    }

    /// Request a debounced sync.
    pub fn request_sync(&self) -> SyncWaiter {
        let (tx, waiter) = SyncWaiter::channel();
        let config = self.shared.config;

        let new_window = {
            let mut inner = self.lock();
            inner.context.pending_count += 1;
            if inner.running {
                inner.next_waiters.push(tx);
                None
            } else {
                inner.waiters.push(tx);
                if inner.window.is_some() {
                    None
                } else {
                    inner.transition(SyncState::Pending);
                    Some(inner.open_window(&config))
                }
            }
        };

        if let Some(generation) = new_window {
            debug!("Opened sync window for {}", self.shared.session_id);
            self.spawn_debounce(generation);
        }
        waiter
    }

    /// Skip the debounce and sync now. If a cycle is running, the next one
    /// starts as soon as it finishes.
    pub fn force_sync(&self) -> SyncWaiter {
        let (tx, waiter) = SyncWaiter::channel();

        let claimed = {
            let mut inner = self.lock();
            inner.context.pending_count += 1;
            if inner.running {
                inner.next_waiters.push(tx);
                inner.force_next = true;
                None
            } else {
                inner.waiters.push(tx);
                if inner.window.take().is_none() {
                    inner.transition(SyncState::Pending);
                }
                Some(inner.claim())
            }
        };

        if let Some(waiters) = claimed {
            self.spawn_cycle(waiters);
        }
        waiter
    }

    /// Abort an open debounce window. Its waiters resolve as
    /// [`SyncOutcome::Skipped`]. A running cycle is not affected.
    pub fn cancel(&self) -> usize {
        let waiters = {
            let mut inner = self.lock();
            if inner.running || inner.window.take().is_none() {
                return 0;
            }
            inner.transition(SyncState::Idle);
            inner.context.pending_count = 0;
            std::mem::take(&mut inner.waiters)
        };

        let count = waiters.len();
        resolve(waiters, SyncOutcome::Skipped);
        debug!(
            "Cancelled sync window for {} ({} waiters)",
            self.shared.session_id, count
        );
        count
    }

    fn spawn_debounce(&self, generation: u64) {
        let manager = self.clone();
        self.supervisor.spawn("sync-debounce", async move {
            manager.run_debounce(generation).await;
        });
    }

    fn spawn_cycle(&self, waiters: Vec<Waiter>) {
        let manager = self.clone();
        self.supervisor.spawn("sync-cycle", async move {
            manager.run_cycle(waiters).await;
        });
    }

    fn spawn_follow_up(&self, follow_up: Option<FollowUp>) {
        match follow_up {
            Some(FollowUp::Debounce(generation)) => self.spawn_debounce(generation),
            Some(FollowUp::Run(waiters)) => self.spawn_cycle(waiters),
            None => {}
        }
    }

    async fn run_debounce(&self, generation: u64) {
        loop {
            let deadline = match self.lock().window.as_ref() {
                Some(window) if window.generation == generation => window.deadline,
                _ => return,
            };
            tokio::time::sleep_until(deadline).await;

            let waiters = {
                let mut inner = self.lock();
                match inner.window.as_ref() {
                    Some(window) if window.generation == generation => {
                        if Instant::now() < window.deadline {
                            continue;
                        }
                    }
                    _ => return,
                }
                inner.window = None;
                inner.claim()
            };

            self.run_cycle(waiters).await;
            return;
        }
    }

    async fn run_cycle(&self, waiters: Vec<Waiter>) {
        let config = self.shared.config;
        let backoff = Backoff::new(config.base_delay, config.max_delay);
        let attempts = config.max_retries.max(1);
        let mut last_error = String::new();
        let mut outcome = None;

        for attempt in 0..attempts {
            match self.shared.target.copy_to().await {
                Ok(CopyToStatus::Synced) => {
                    self.lock().transition(SyncState::Flushing);
                    if let Err(e) = self.shared.target.flush().await {
                        warn!(
                            "Flush after sync failed for {} (ignored): {}",
                            self.shared.session_id, e
                        );
                    }
                    outcome = Some(SyncOutcome::Synced);
                    break;
                }
                Ok(CopyToStatus::NoLocalData) => {
                    self.lock().transition(SyncState::Flushing);
                    outcome = Some(SyncOutcome::NoLocalData);
                    break;
                }
                Ok(status) => last_error = status.to_string(),
                Err(e) => last_error = SyncError::from(e).to_string(),
            }

            if attempt + 1 < attempts {
                let delay = backoff.delay(attempt);
                warn!(
                    "Sync attempt {}/{} for {} failed, retrying in {:?}: {}",
                    attempt + 1,
                    attempts,
                    self.shared.session_id,
                    delay,
                    last_error
                );
                {
                    let mut inner = self.lock();
                    inner.transition(SyncState::Retrying);
                    inner.context.retry_count = attempt + 1;
                    inner.context.last_error = Some(last_error.clone());
                }
                tokio::time::sleep(delay).await;
                self.lock().transition(SyncState::Syncing);
            }
        }

        match outcome {
            Some(outcome) => self.finish_success(waiters, outcome),
            None => self.finish_failure(waiters, attempts, last_error).await,
        }
    }

    fn finish_success(&self, waiters: Vec<Waiter>, outcome: SyncOutcome) {
        let follow_up = {
            let mut inner = self.lock();
            inner.running = false;
            inner.context.last_sync_at = Some(Utc::now());
            inner.context.last_error = None;
            inner.context.retry_count = 0;
            let follow_up = inner.follow_up(&self.shared.config);
            if follow_up.is_none() {
                inner.transition(SyncState::Idle);
            }
            follow_up
        };

        debug!(
            "Sync for {} finished: {:?} ({} waiters)",
            self.shared.session_id,
            outcome,
            waiters.len()
        );
        resolve(waiters, outcome);
        self.spawn_follow_up(follow_up);
    }

    async fn finish_failure(&self, waiters: Vec<Waiter>, attempts: u32, last_error: String) {
        {
            let mut inner = self.lock();
            inner.transition(SyncState::Error);
            inner.context.last_error = Some(last_error.clone());
        }
        error!(
            "Sync for {} failed after {} attempts: {}",
            self.shared.session_id, attempts, last_error
        );

        let paths = vec![self.shared.target.source_path()];
        if let Err(e) = self
            .shared
            .ledger
            .record_failure(&self.shared.session_id, &last_error, paths)
            .await
        {
            error!(
                "Could not record failed sync for {}: {}",
                self.shared.session_id, e
            );
        }

        let follow_up = {
            let mut inner = self.lock();
            inner.transition(SyncState::Idle);
            inner.running = false;
            inner.context.retry_count = 0;
            inner.follow_up(&self.shared.config)
        };

        let message = SyncError::Exhausted {
            attempts,
            last_error,
        }
        .to_string();
        resolve(waiters, SyncOutcome::Failed(message));
        self.spawn_follow_up(follow_up);
        info!("Sync manager for {} back to idle", self.shared.session_id);
    }
}

fn resolve(waiters: Vec<Waiter>, outcome: SyncOutcome) {
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}
