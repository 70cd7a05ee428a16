//! redb table definitions for the Keel state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}` so related
//! records sort next to each other.

use redb::TableDefinition;

/// Workspaces keyed by `{workspace_id}`.
pub const WORKSPACES: TableDefinition<&str, &[u8]> = TableDefinition::new("workspaces");

/// Projects keyed by `{project_id}`.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

/// Environments keyed by `{environment_id}`.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Instances keyed by `{deployment_id}:{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Sentinels keyed by `{sentinel_id}`.
pub const SENTINELS: TableDefinition<&str, &[u8]> = TableDefinition::new("sentinels");

/// Gateways keyed by `{gateway_id}`.
pub const GATEWAYS: TableDefinition<&str, &[u8]> = TableDefinition::new("gateways");

/// Domains keyed by `{hostname}`.
pub const DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("domains");

/// Deployment progress log keyed by `{deployment_id}:{seq:010}`.
pub const PROGRESS: TableDefinition<&str, &[u8]> = TableDefinition::new("progress");

/// Workflow step checkpoints keyed by `{workflow_key}/{step}`.
pub const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

/// Gateway configs keyed by `{partition}/{hostname}` (routing database only).
pub const GATEWAY_CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("gateway_configs");
