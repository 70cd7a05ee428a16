//! Bounded FIFO event buffer with a configurable drop policy.
//!
//! Producers never block: when the buffer is full, one item is discarded
//! according to the [`DropPolicy`] fixed at construction. Consumers await
//! [`EventBuffer::pop`], which parks on a `Notify` until an item arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::trace;

/// What to discard when pushing into a full buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the head of the queue to make room for the new item.
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the incoming item.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    pub policy: DropPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            policy: DropPolicy::DropOldest,
        }
    }
}

impl BufferConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: DropPolicy) -> Self {
        self.policy = policy;
        self
    }
}

pub struct EventBuffer<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    policy: DropPolicy,
    dropped: AtomicU64,
}

impl<T> EventBuffer<T> {
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            policy: config.policy,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `item`. Returns the discarded item if the buffer was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut queue = self.lock();
            if queue.len() < self.capacity {
                queue.push_back(item);
                None
            } else {
                match self.policy {
                    DropPolicy::DropOldest => {
                        let head = queue.pop_front();
                        queue.push_back(item);
                        head
                    }
                    DropPolicy::DropNewest => Some(item),
                }
            }
        };
        if evicted.is_some() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(policy = ?self.policy, total, "buffer full, item dropped");
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Wait for and dequeue the next item.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remove and return everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }
}
