//! Domain types for the Keel state store.
//!
//! These types represent the persisted control-plane records: tenancy
//! (workspaces, projects, environments), workloads (deployments,
//! sentinels, gateways, instances), routing (domains, gateway configs),
//! and workflow bookkeeping. All types are serializable to/from JSON for
//! storage in redb tables.

use std::time::{SystemTime, UNIX_EPOCH};

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::tables::*;

pub type WorkspaceId = String;
pub type ProjectId = String;
pub type EnvironmentId = String;
pub type DeploymentId = String;
pub type InstanceId = String;

/// A JSON-serialized row with a stable primary key.
pub trait Record: Serialize + DeserializeOwned {
    /// Table holding rows of this type.
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;

    /// Primary key within [`Record::TABLE`].
    fn table_key(&self) -> String;
}

/// A workload record with a desired state that agents converge on.
pub trait DesiredRecord: Record {
    fn desired_state(&self) -> DesiredState;
    fn region(&self) -> &str;
}

// ── Tenancy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: WorkspaceId,
    /// DNS-safe short name used when building hostnames.
    pub slug: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub workspace_id: WorkspaceId,
    pub slug: String,
    /// Deployment currently serving the project's live traffic.
    pub live_deployment_id: Option<DeploymentId>,
    /// Set by rollback, cleared by promote. While set, new deploys do not
    /// move environment/live domains.
    pub is_rolled_back: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: EnvironmentId,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    /// e.g. `production`, `preview`.
    pub slug: String,
    /// Keyspace used by gateways to verify API keys, if auth is enabled.
    pub auth_keyspace_id: Option<String>,
}

// ── Workloads ─────────────────────────────────────────────────────

/// What the control plane wants agents to do with a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Standby,
    Archived,
}

/// Observed lifecycle of a deployment, driven by the deploy workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Deploying,
    Ready,
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Ready | DeploymentStatus::Failed)
    }
}

/// Resource shape requested for a workload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Resources {
    pub replicas: u32,
    pub cpu_millicores: u32,
    pub memory_mib: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub git_commit_sha: Option<String>,
    pub git_branch: Option<String>,
    /// Container image. Empty until the build step has produced one.
    pub image: Option<String>,
    pub region: String,
    pub shard: Option<String>,
    pub resources: Resources,
    pub desired_state: DesiredState,
    pub status: DeploymentStatus,
    /// API schema document fetched from a running instance, if any.
    pub openapi_spec: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle of one running replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub deployment_id: DeploymentId,
    pub region: String,
    /// `host:port` the gateway forwards to.
    pub address: String,
    pub cpu_millicores: u32,
    pub memory_mib: u32,
    pub status: InstanceStatus,
    pub updated_at: u64,
}

/// Aggregated health an agent reports for a sentinel or gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadHealth {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-environment validation worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sentinel {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub region: String,
    pub shard: Option<String>,
    pub image: String,
    pub resources: Resources,
    pub desired_state: DesiredState,
    pub available_replicas: u32,
    pub health: WorkloadHealth,
    pub updated_at: u64,
}

/// Regional ingress gateway instance set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gateway {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub region: String,
    pub shard: Option<String>,
    pub image: String,
    pub resources: Resources,
    pub desired_state: DesiredState,
    pub available_replicas: u32,
    pub health: WorkloadHealth,
    pub updated_at: u64,
}

// ── Routing ───────────────────────────────────────────────────────

/// How a domain follows new deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sticky {
    /// Pinned to one commit; never reassigned.
    None,
    Branch,
    Environment,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Domain {
    pub id: String,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub hostname: String,
    pub deployment_id: DeploymentId,
    pub sticky: Sticky,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    pub keyspace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    pub openapi_spec: String,
}

/// Routing descriptor a gateway serves for one hostname.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub hostname: String,
    pub workspace_id: WorkspaceId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub deployment_id: DeploymentId,
    /// Instance addresses (`host:port`) to balance across.
    pub instances: Vec<String>,
    pub auth: Option<AuthConfig>,
    pub validation: Option<ValidationConfig>,
    pub updated_at: u64,
}

// ── Workflow bookkeeping ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Pending,
    Building,
    Deploying,
    Network,
    Completed,
    Failed,
}

/// One line of a deployment's user-visible progress log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEntry {
    pub deployment_id: DeploymentId,
    pub seq: u64,
    pub phase: ProgressPhase,
    pub message: String,
    pub at: u64,
}

// ── Listing ───────────────────────────────────────────────────────

/// Filter for cursor-paginated workload listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListFilter {
    pub desired_state: DesiredState,
    /// `None` matches every region.
    pub region: Option<String>,
}

impl ListFilter {
    pub fn running_in(region: Option<&str>) -> Self {
        Self {
            desired_state: DesiredState::Running,
            region: region.map(str::to_string),
        }
    }

    pub fn matches<R: DesiredRecord>(&self, record: &R) -> bool {
        record.desired_state() == self.desired_state
            && self.region.as_deref().is_none_or(|r| r == record.region())
    }
}

/// One page of a listing plus the cursor for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Key of the last row returned; `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

// ── Record impls ──────────────────────────────────────────────────

impl Record for Workspace {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = WORKSPACES;
    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for Project {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = PROJECTS;
    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for Environment {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = ENVIRONMENTS;
    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl Record for Deployment {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = DEPLOYMENTS;
    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl DesiredRecord for Deployment {
    fn desired_state(&self) -> DesiredState {
        self.desired_state
    }
    fn region(&self) -> &str {
        &self.region
    }
}

impl Record for Instance {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = INSTANCES;
    fn table_key(&self) -> String {
        instance_key(&self.deployment_id, &self.id)
    }
}

impl Record for Sentinel {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = SENTINELS;
    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl DesiredRecord for Sentinel {
    fn desired_state(&self) -> DesiredState {
        self.desired_state
    }
    fn region(&self) -> &str {
        &self.region
    }
}

impl Record for Gateway {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = GATEWAYS;
    fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl DesiredRecord for Gateway {
    fn desired_state(&self) -> DesiredState {
        self.desired_state
    }
    fn region(&self) -> &str {
        &self.region
    }
}

impl Record for Domain {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = DOMAINS;
    fn table_key(&self) -> String {
        self.hostname.clone()
    }
}

impl Record for ProgressEntry {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = PROGRESS;
    fn table_key(&self) -> String {
        format!("{}:{:010}", self.deployment_id, self.seq)
    }
}

/// Build the composite key for the instances table.
pub fn instance_key(deployment_id: &str, instance_id: &str) -> String {
    format!("{deployment_id}:{instance_id}")
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
