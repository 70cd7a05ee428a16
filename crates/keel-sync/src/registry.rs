//! Registry of connected agents.
//!
//! One [`AgentEntry`] per client id, holding the agent's selectors and its
//! delivery buffer. The map itself sits behind a single `RwLock`: watch
//! registration takes the write side, fan-out takes the read side and
//! releases it before touching any buffer.
//!
//! Entries survive stream disconnects so a reconnecting agent picks up
//! what was buffered while it was away. Entries with no live stream that
//! stay idle past a TTL are removed by [`AgentRegistry::evict_idle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::buffer::{BufferConfig, EventBuffer};
use crate::event::{InfraEvent, Selectors};

pub struct AgentEntry {
    client_id: String,
    selectors: RwLock<Selectors>,
    buffer: Arc<EventBuffer<InfraEvent>>,
    streams: AtomicUsize,
    last_seen: Mutex<Instant>,
}

impl AgentEntry {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn selectors(&self) -> Selectors {
        self.selectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn buffer(&self) -> &Arc<EventBuffer<InfraEvent>> {
        &self.buffer
    }

    pub fn live_streams(&self) -> usize {
        self.streams.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Mark a watch stream as attached. The returned guard detaches it on drop.
    pub fn attach(self: &Arc<Self>) -> StreamGuard {
        self.streams.fetch_add(1, Ordering::AcqRel);
        self.touch();
        StreamGuard {
            entry: Arc::clone(self),
        }
    }
}

/// Keeps an agent entry marked as streaming while alive.
pub struct StreamGuard {
    entry: Arc<AgentEntry>,
}

impl StreamGuard {
    pub fn entry(&self) -> &Arc<AgentEntry> {
        &self.entry
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.entry.streams.fetch_sub(1, Ordering::AcqRel);
        self.entry.touch();
        debug!(client_id = %self.entry.client_id, "watch stream detached");
    }
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    buffer_config: BufferConfig,
}

impl AgentRegistry {
    pub fn new(buffer_config: BufferConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            buffer_config,
        }
    }

    /// Register `client_id` or refresh an existing registration.
    ///
    /// An existing entry keeps its buffer; its selectors are replaced.
    pub fn register(&self, client_id: &str, selectors: Selectors) -> Arc<AgentEntry> {
        if let Some(entry) = self.get(client_id) {
            *entry
                .selectors
                .write()
                .unwrap_or_else(PoisonError::into_inner) = selectors;
            entry.touch();
            return entry;
        }

        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let entry = agents
            .entry(client_id.to_string())
            .or_insert_with(|| {
                info!(%client_id, ?selectors, "agent registered");
                Arc::new(AgentEntry {
                    client_id: client_id.to_string(),
                    selectors: RwLock::new(selectors.clone()),
                    buffer: Arc::new(EventBuffer::new(self.buffer_config)),
                    streams: AtomicUsize::new(0),
                    last_seen: Mutex::new(Instant::now()),
                })
            })
            .clone();
        // Lost a registration race: apply our selectors to the winner.
        *entry
            .selectors
            .write()
            .unwrap_or_else(PoisonError::into_inner) = selectors;
        entry
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<AgentEntry>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    /// Point-in-time copy of every registered entry.
    pub fn snapshot(&self) -> Vec<Arc<AgentEntry>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove entries with no live stream that have been idle longer than `ttl`.
    ///
    /// Returns the evicted client ids.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = agents
            .values()
            .filter(|e| e.live_streams() == 0 && e.idle_for() > ttl)
            .map(|e| e.client_id.clone())
            .collect();
        for client_id in &stale {
            if let Some(entry) = agents.remove(client_id) {
                info!(
                    %client_id,
                    pending = entry.buffer.len(),
                    dropped = entry.buffer.dropped(),
                    "idle agent evicted"
                );
            }
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResourceKind;

    fn selectors(region: &str) -> Selectors {
        [("region".to_string(), region.to_string())].into_iter().collect()
    }

    #[test]
    fn register_is_idempotent_and_keeps_buffer() {
        let registry = AgentRegistry::new(BufferConfig::default());
        let first = registry.register("agent-1", selectors("us-east-1"));
        first
            .buffer()
            .push(InfraEvent::delete(ResourceKind::Deployment, "d-1", None));

        let second = registry.register("agent-1", selectors("us-west-2"));
        assert!(Arc::ptr_eq(first.buffer(), second.buffer()));
        assert_eq!(second.buffer().len(), 1);
        assert_eq!(second.selectors(), selectors("us-west-2"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stream_guard_tracks_live_streams() {
        let registry = AgentRegistry::new(BufferConfig::default());
        let entry = registry.register("agent-1", Selectors::new());
        let guard = entry.attach();
        assert_eq!(entry.live_streams(), 1);
        drop(guard);
        assert_eq!(entry.live_streams(), 0);
    }

    #[test]
    fn evict_idle_skips_streaming_agents() {
        let registry = AgentRegistry::new(BufferConfig::default());
        let streaming = registry.register("streaming", Selectors::new());
        let _guard = streaming.attach();
        registry.register("idle", Selectors::new());

        let evicted = registry.evict_idle(Duration::ZERO);
        assert_eq!(evicted, vec!["idle".to_string()]);
        assert!(registry.get("streaming").is_some());
        assert!(registry.get("idle").is_none());
    }

    #[test]
    fn evict_idle_respects_ttl() {
        let registry = AgentRegistry::new(BufferConfig::default());
        registry.register("agent-1", Selectors::new());
        assert!(registry.evict_idle(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.len(), 1);
    }
}
