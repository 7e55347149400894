//! Holding area for messages that arrive while the sandbox is unreachable.
//!
//! Not a durability mechanism: every buffered chat message has already been
//! queued for persistence. Entries are pruned lazily on every call, both by
//! count (oldest dropped first) and by age.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;
use uuid::Uuid;

/// Buffer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub max_size: usize,
    pub max_age: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: Duration::from_secs(5 * 60),
        }
    }
}

/// A message waiting for redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: String,
    /// Serialized agent command, sent as-is on redelivery.
    pub raw: String,
    pub message_type: String,
    pub enqueued_at: Instant,
    pub attempt_count: u32,
}

/// Bounded FIFO of [`PendingMessage`]s.
#[derive(Debug)]
pub struct PendingMessageBuffer {
    config: BufferConfig,
    items: VecDeque<PendingMessage>,
}

impl PendingMessageBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            items: VecDeque::new(),
        }
    }

    /// Append a message and return its id. Drops the oldest entry when full.
    pub fn add(&mut self, raw: impl Into<String>, message_type: impl Into<String>) -> String {
        self.prune();

        let id = Uuid::new_v4().to_string();
        self.items.push_back(PendingMessage {
            id: id.clone(),
            raw: raw.into(),
            message_type: message_type.into(),
            enqueued_at: Instant::now(),
            attempt_count: 0,
        });

        while self.items.len() > self.config.max_size {
            if let Some(dropped) = self.items.pop_front() {
                warn!(
                    "Pending buffer full ({}), dropped oldest {} message {}",
                    self.config.max_size, dropped.message_type, dropped.id
                );
            }
        }
        id
    }

    /// Remove and return all live messages in arrival order.
    pub fn drain(&mut self) -> Vec<PendingMessage> {
        self.prune();
        self.items.drain(..).collect()
    }

    /// Oldest live message, if any.
    pub fn peek(&mut self) -> Option<&PendingMessage> {
        self.prune();
        self.items.front()
    }

    /// Remove a message by id. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        self.prune();
        match self.items.iter().position(|m| m.id == id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Put undelivered messages back at the front, keeping their order.
    pub fn requeue(&mut self, messages: Vec<PendingMessage>) {
        for mut message in messages.into_iter().rev() {
            message.attempt_count += 1;
            self.items.push_front(message);
        }
        self.items.truncate(self.config.max_size);
        self.prune();
    }

    pub fn len(&mut self) -> usize {
        self.prune();
        self.items.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn prune(&mut self) {
        let max_age = self.config.max_age;
        let before = self.items.len();
        self.items.retain(|m| m.enqueued_at.elapsed() <= max_age);
        let pruned = before - self.items.len();
        if pruned > 0 {
            debug!("Pruned {} expired pending messages", pruned);
        }
    }
}

impl Default for PendingMessageBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}
