//! The control-plane surface an agent talks to.
//!
//! [`ControlPlane`] is implemented in-process by
//! [`SyncService`](crate::service::SyncService) and over the network by
//! [`GrpcControlPlane`](crate::client::GrpcControlPlane), so the agent's
//! sync engine does not care which one it is wired to.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::event::{InfraEvent, LABEL_REGION, ResourceKind, Selectors, StatusUpdate};

/// Stream of desired-state events handed to an agent.
pub type EventStream = Pin<Box<dyn Stream<Item = SyncResult<InfraEvent>> + Send>>;

/// Who an agent is and what it wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Stable for the lifetime of the agent process.
    pub client_id: String,
    pub region: String,
    pub shard: String,
    pub selectors: Selectors,
}

impl AgentIdentity {
    /// Identity whose selectors constrain delivery to `region`.
    pub fn new(client_id: &str, region: &str, shard: &str) -> Self {
        let mut selectors = Selectors::new();
        selectors.insert(LABEL_REGION.to_string(), region.to_string());
        Self {
            client_id: client_id.to_string(),
            region: region.to_string(),
            shard: shard.to_string(),
            selectors,
        }
    }

    pub fn with_selector(mut self, key: &str, value: &str) -> Self {
        self.selectors.insert(key.to_string(), value.to_string());
        self
    }

    /// Region used to filter full-state pulls. Absent means every region.
    pub fn region_selector(&self) -> Option<&str> {
        self.selectors.get(LABEL_REGION).map(String::as_str)
    }
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Long-lived stream of incremental events for this agent.
    async fn watch(&self, identity: &AgentIdentity) -> SyncResult<EventStream>;

    /// One `Apply` per running resource matching the agent's region.
    async fn desired_state(&self, identity: &AgentIdentity) -> SyncResult<EventStream>;

    /// Current desired state of a single resource, `Delete` if it should not run.
    async fn desired_workload(
        &self,
        identity: &AgentIdentity,
        kind: ResourceKind,
        id: &str,
    ) -> SyncResult<InfraEvent>;

    /// Push observed state upstream. Safe to replay.
    async fn report(&self, identity: &AgentIdentity, update: StatusUpdate) -> SyncResult<()>;
}
