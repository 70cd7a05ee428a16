//! Outbound queue of observed-state updates.

use std::sync::Arc;

use tracing::warn;

use keel_sync::{BufferConfig, EventBuffer, StatusUpdate};

/// Cheap handle controllers use to queue status updates for the push loop.
///
/// Reporting never blocks. When the queue is full the configured drop
/// policy applies; a later refresh re-reports whatever was lost.
#[derive(Clone)]
pub struct Reporter {
    queue: Arc<EventBuffer<StatusUpdate>>,
}

impl Reporter {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            queue: Arc::new(EventBuffer::new(config)),
        }
    }

    pub fn report(&self, update: StatusUpdate) {
        if let Some(dropped) = self.queue.push(update) {
            warn!(?dropped, "outbound status queue full, update dropped");
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn queue(&self) -> &Arc<EventBuffer<StatusUpdate>> {
        &self.queue
    }
}
