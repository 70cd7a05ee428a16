//! Infrastructure events and observed-state reports.
//!
//! An [`InfraEvent`] tells an agent what one resource should look like
//! (`Apply`) or that it should be gone (`Delete`). Ordering only holds per
//! resource id within one delivery channel, so consumers treat every
//! event as an idempotent, replayable assertion.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use keel_state::{DeploymentStatus, Instance, Resources, WorkloadHealth};

use crate::error::{SyncError, SyncResult};

/// Label key→value map attached to emitted events.
pub type Labels = BTreeMap<String, String>;

/// Label key→value constraints an agent registers with.
pub type Selectors = BTreeMap<String, String>;

pub const LABEL_REGION: &str = "region";
pub const LABEL_SHARD: &str = "shard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Deployment,
    Sentinel,
    Gateway,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Deployment => f.write_str("deployment"),
            ResourceKind::Sentinel => f.write_str("sentinel"),
            ResourceKind::Gateway => f.write_str("gateway"),
        }
    }
}

/// Identifies a resource to delete.
///
/// `namespace` is known when the control plane still has the record; an
/// agent resolves it from its own inventory otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub id: String,
    pub namespace: Option<String>,
}

/// Desired state of an application deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentIntent {
    pub deployment_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub namespace: String,
    pub image: String,
    pub region: String,
    pub resources: Resources,
}

/// Desired state of a sentinel validation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentinelIntent {
    pub sentinel_id: String,
    pub workspace_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub namespace: String,
    pub image: String,
    pub region: String,
    pub resources: Resources,
}

/// Desired state of a regional gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayIntent {
    pub gateway_id: String,
    pub workspace_id: String,
    pub namespace: String,
    pub image: String,
    pub region: String,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change<T> {
    Apply(T),
    Delete(WorkloadRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraEvent {
    Deployment(Change<DeploymentIntent>),
    Sentinel(Change<SentinelIntent>),
    Gateway(Change<GatewayIntent>),
}

impl InfraEvent {
    pub fn kind(&self) -> ResourceKind {
        match self {
            InfraEvent::Deployment(_) => ResourceKind::Deployment,
            InfraEvent::Sentinel(_) => ResourceKind::Sentinel,
            InfraEvent::Gateway(_) => ResourceKind::Gateway,
        }
    }

    /// Id of the resource this event is about.
    pub fn resource_id(&self) -> &str {
        match self {
            InfraEvent::Deployment(Change::Apply(d)) => &d.deployment_id,
            InfraEvent::Sentinel(Change::Apply(s)) => &s.sentinel_id,
            InfraEvent::Gateway(Change::Apply(g)) => &g.gateway_id,
            InfraEvent::Deployment(Change::Delete(r))
            | InfraEvent::Sentinel(Change::Delete(r))
            | InfraEvent::Gateway(Change::Delete(r)) => &r.id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            InfraEvent::Deployment(Change::Delete(_))
                | InfraEvent::Sentinel(Change::Delete(_))
                | InfraEvent::Gateway(Change::Delete(_))
        )
    }

    /// Build a `Delete` event of the given kind.
    pub fn delete(kind: ResourceKind, id: &str, namespace: Option<String>) -> Self {
        let target = WorkloadRef {
            id: id.to_string(),
            namespace,
        };
        match kind {
            ResourceKind::Deployment => InfraEvent::Deployment(Change::Delete(target)),
            ResourceKind::Sentinel => InfraEvent::Sentinel(Change::Delete(target)),
            ResourceKind::Gateway => InfraEvent::Gateway(Change::Delete(target)),
        }
    }
}

impl DeploymentIntent {
    pub fn validate(&self) -> SyncResult<()> {
        require("deployment_id", &self.deployment_id)?;
        require("workspace_id", &self.workspace_id)?;
        require("namespace", &self.namespace)?;
        require("image", &self.image)?;
        validate_resources(&self.deployment_id, &self.resources)
    }
}

impl SentinelIntent {
    pub fn validate(&self) -> SyncResult<()> {
        require("sentinel_id", &self.sentinel_id)?;
        require("workspace_id", &self.workspace_id)?;
        require("namespace", &self.namespace)?;
        require("image", &self.image)?;
        validate_resources(&self.sentinel_id, &self.resources)
    }
}

impl GatewayIntent {
    pub fn validate(&self) -> SyncResult<()> {
        require("gateway_id", &self.gateway_id)?;
        require("workspace_id", &self.workspace_id)?;
        require("namespace", &self.namespace)?;
        require("image", &self.image)?;
        validate_resources(&self.gateway_id, &self.resources)
    }
}

fn require(field: &str, value: &str) -> SyncResult<()> {
    if value.trim().is_empty() {
        return Err(SyncError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

fn validate_resources(id: &str, resources: &Resources) -> SyncResult<()> {
    if resources.replicas == 0 || resources.cpu_millicores == 0 || resources.memory_mib == 0 {
        return Err(SyncError::InvalidArgument(format!(
            "{id}: replicas, cpu and memory must be positive (got {resources:?})"
        )));
    }
    Ok(())
}

// ── Observed state (agent → control plane) ─────────────────────────

/// Change to one instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceChange {
    /// Full replacement of the instance row.
    Upsert(Instance),
    Delete {
        deployment_id: String,
        instance_id: String,
    },
}

/// Observed replica count and health of a sentinel or gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub id: String,
    pub available_replicas: u32,
    pub health: WorkloadHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusReport {
    pub deployment_id: String,
    pub status: DeploymentStatus,
}

/// Anything an agent pushes upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusUpdate {
    Instance(InstanceChange),
    Sentinel(WorkloadReport),
    Gateway(WorkloadReport),
    Deployment(DeploymentStatusReport),
}
