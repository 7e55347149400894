//! Ordered, retried writer of conversation records.
//!
//! Records are written strictly in enqueue order by a single drain task. A
//! record that keeps failing blocks the ones behind it only until its retries
//! are exhausted; it is then dropped and its receipt resolves to `None`.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{error, warn};
use tokio::sync::{oneshot, watch};

use skiff_protocol::{MessageMetadata, MessageRole, MessageType, NewRecord};

use super::record_store::RecordStore;
use crate::retry::Backoff;
use crate::supervisor::Supervisor;

/// Retry policy for record writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Total attempts per record, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl PersistenceConfig {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay)
    }
}

/// Resolves to the durable message id, or `None` if the record was dropped.
#[derive(Debug)]
pub struct PersistReceipt {
    rx: oneshot::Receiver<Option<String>>,
}

impl Future for PersistReceipt {
    type Output = Option<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.ok().flatten())
    }
}

struct QueuedRecord {
    record: NewRecord,
    reply: oneshot::Sender<Option<String>>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedRecord>,
    in_flight: bool,
}

struct Shared {
    session_id: String,
    store: Arc<dyn RecordStore>,
    config: PersistenceConfig,
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
}

/// Per-session persistence queue. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceQueue {
    shared: Arc<Shared>,
    supervisor: Supervisor,
}

impl PersistenceQueue {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn RecordStore>,
        config: PersistenceConfig,
        supervisor: Supervisor,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                store,
                config,
                state: Mutex::new(QueueState::default()),
                idle,
            }),
            supervisor,
        }
    }

    /// Queue a record. Its position is fixed when this returns.
    pub fn enqueue(
        &self,
        role: MessageRole,
        content: impl Into<String>,
        metadata: Option<MessageMetadata>,
        message_type: MessageType,
    ) -> PersistReceipt {
        let (reply, rx) = oneshot::channel();
        let record = NewRecord {
            role,
            message_type,
            content: content.into(),
            metadata,
        };

        let start_drain = {
            let mut state = match self.shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.items.push_back(QueuedRecord { record, reply });
            let start = !std::mem::replace(&mut state.in_flight, true);
            if start {
                self.shared.idle.send_replace(false);
            }
            start
        };

        if start_drain {
            let shared = self.shared.clone();
            self.supervisor
                .spawn("persistence-drain", async move { drain(shared).await });
        }

        PersistReceipt { rx }
    }

    /// Wait until every queued record has been written or dropped.
    pub async fn flush(&self) {
        let mut idle = self.shared.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Records queued or in flight.
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|s| s.items.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let record = {
            let mut state = match shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match state.items.front() {
                Some(item) => item.record.clone(),
                None => {
                    state.in_flight = false;
                    shared.idle.send_replace(true);
                    return;
                }
            }
        };

        let message_id = write_with_retry(&shared, &record).await;

        let item = match shared.state.lock() {
            Ok(mut state) => state.items.pop_front(),
            Err(poisoned) => poisoned.into_inner().items.pop_front(),
        };
        if let Some(item) = item {
            let _ = item.reply.send(message_id);
        }
    }
}

async fn write_with_retry(shared: &Shared, record: &NewRecord) -> Option<String> {
    let backoff = shared.config.backoff();
    let max_attempts = shared.config.max_attempts.max(1);

    for attempt in 0..max_attempts {
        match shared.store.append(&shared.session_id, record).await {
            Ok(receipt) => return Some(receipt.message_id),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = backoff.delay(attempt);
                warn!(
                    "Persisting {} record for {} failed (attempt {}/{}), retrying in {:?}: {}",
                    record.role,
                    shared.session_id,
                    attempt + 1,
                    max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                error!(
                    "Dropping {} record for {} after {} attempts: {}",
                    record.role, shared.session_id, max_attempts, e
                );
                return None;
            }
            Err(e) => {
                error!(
                    "Dropping {} record for {} (not retryable): {}",
                    record.role, shared.session_id, e
                );
                return None;
            }
        }
    }
    None
}
