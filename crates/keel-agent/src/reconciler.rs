//! Reconciler — desired-state events to orchestrator mutations.
//!
//! Applying is idempotent: the desired spec is hashed and compared with
//! the spec already running, and an identical spec issues no mutation. A
//! changed spec is replaced in place, never deleted and recreated. After
//! every apply or delete the resulting observed state is queued upstream
//! through the [`Reporter`].

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use keel_state::{Instance, InstanceStatus, Resources, WorkloadHealth, epoch_secs};
use keel_sync::{
    AgentIdentity, ControlPlane, DeploymentIntent, EventBuffer, GatewayIntent, InfraEvent,
    InstanceChange, ResourceKind, SentinelIntent, StatusUpdate, WorkloadRef, WorkloadReport,
};

use crate::error::{AgentError, AgentResult, OrchestratorError};
use crate::orchestrator::{
    KIND_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, Orchestrator, ReplicaStatus, WorkloadKey,
    WorkloadSpec,
};
use crate::reporter::Reporter;

/// What an apply did to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

pub struct Reconciler {
    orchestrator: Arc<dyn Orchestrator>,
    reporter: Reporter,
    region: String,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, reporter: Reporter, region: &str) -> Self {
        Self {
            orchestrator,
            reporter,
            region: region.to_string(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    // ── Apply ──────────────────────────────────────────────────────

    pub async fn apply_deployment(&self, intent: &DeploymentIntent) -> AgentResult<ApplyOutcome> {
        intent
            .validate()
            .map_err(|e| AgentError::Validation(e.to_string()))?;
        let key = WorkloadKey::new(
            ResourceKind::Deployment,
            &intent.namespace,
            &intent.deployment_id,
        );
        let mut env = BTreeMap::new();
        env.insert("KEEL_DEPLOYMENT_ID".to_string(), intent.deployment_id.clone());
        env.insert("KEEL_ENVIRONMENT_ID".to_string(), intent.environment_id.clone());
        env.insert("KEEL_REGION".to_string(), intent.region.clone());
        let spec = workload_spec(&key, &intent.image, intent.resources, env);

        let outcome = self.apply_workload(&key, spec).await?;
        let status = self.orchestrator.replicas(&key).await?;
        for replica in &status.replicas {
            self.reporter
                .report(StatusUpdate::Instance(InstanceChange::Upsert(Instance {
                    id: replica.name.clone(),
                    deployment_id: intent.deployment_id.clone(),
                    region: self.region.clone(),
                    address: replica.address.clone(),
                    cpu_millicores: intent.resources.cpu_millicores,
                    memory_mib: intent.resources.memory_mib,
                    status: if replica.ready {
                        InstanceStatus::Running
                    } else {
                        InstanceStatus::Provisioning
                    },
                    updated_at: epoch_secs(),
                })));
        }
        Ok(outcome)
    }

    pub async fn apply_sentinel(&self, intent: &SentinelIntent) -> AgentResult<ApplyOutcome> {
        intent
            .validate()
            .map_err(|e| AgentError::Validation(e.to_string()))?;
        let key = WorkloadKey::new(ResourceKind::Sentinel, &intent.namespace, &intent.sentinel_id);
        let mut env = BTreeMap::new();
        env.insert("KEEL_SENTINEL_ID".to_string(), intent.sentinel_id.clone());
        env.insert("KEEL_ENVIRONMENT_ID".to_string(), intent.environment_id.clone());
        let spec = workload_spec(&key, &intent.image, intent.resources, env);

        let outcome = self.apply_workload(&key, spec).await?;
        let status = self.orchestrator.replicas(&key).await?;
        self.reporter
            .report(StatusUpdate::Sentinel(workload_report(&intent.sentinel_id, &status)));
        Ok(outcome)
    }

    pub async fn apply_gateway(&self, intent: &GatewayIntent) -> AgentResult<ApplyOutcome> {
        intent
            .validate()
            .map_err(|e| AgentError::Validation(e.to_string()))?;
        let key = WorkloadKey::new(ResourceKind::Gateway, &intent.namespace, &intent.gateway_id);
        let mut env = BTreeMap::new();
        env.insert("KEEL_GATEWAY_ID".to_string(), intent.gateway_id.clone());
        env.insert("KEEL_REGION".to_string(), intent.region.clone());
        let spec = workload_spec(&key, &intent.image, intent.resources, env);

        let outcome = self.apply_workload(&key, spec).await?;
        let status = self.orchestrator.replicas(&key).await?;
        self.reporter
            .report(StatusUpdate::Gateway(workload_report(&intent.gateway_id, &status)));
        Ok(outcome)
    }

    async fn ensure_namespace(&self, namespace: &str) -> AgentResult<()> {
        if !self.orchestrator.namespace_exists(namespace).await? {
            self.orchestrator.create_namespace(namespace).await?;
            info!(%namespace, "namespace created");
        }
        Ok(())
    }

    async fn apply_workload(&self, key: &WorkloadKey, spec: WorkloadSpec) -> AgentResult<ApplyOutcome> {
        self.ensure_namespace(&key.namespace).await?;

        let existing = match self.orchestrator.get(key).await? {
            Some(existing) => existing,
            None => match self.orchestrator.create(key, spec.clone()).await {
                Ok(_) => {
                    info!(%key, replicas = spec.replicas, "workload created");
                    return Ok(ApplyOutcome::Created);
                }
                // Created concurrently; fall through to the diff.
                Err(OrchestratorError::AlreadyExists(_)) => self
                    .orchestrator
                    .get(key)
                    .await?
                    .ok_or_else(|| OrchestratorError::Conflict(key.to_string()))?,
                Err(e) => return Err(e.into()),
            },
        };

        if spec_hash(&existing.spec)? == spec_hash(&spec)? {
            debug!(%key, "workload unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }
        let updated = self.orchestrator.replace(key, spec).await?;
        info!(%key, generation = updated.generation, "workload updated");
        Ok(ApplyOutcome::Updated)
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Remove a workload. Already-absent workloads count as success.
    ///
    /// Returns true if something was deleted.
    pub async fn delete(&self, kind: ResourceKind, target: &WorkloadRef) -> AgentResult<bool> {
        let namespace = match &target.namespace {
            Some(ns) => Some(ns.clone()),
            None => self.resolve_namespace(kind, &target.id).await?,
        };
        let Some(namespace) = namespace else {
            debug!(%kind, id = %target.id, "delete for unknown workload, nothing to do");
            self.report_deleted(kind, &target.id, &ReplicaStatus::default());
            return Ok(false);
        };

        let key = WorkloadKey::new(kind, &namespace, &target.id);
        let last_seen = match self.orchestrator.replicas(&key).await {
            Ok(status) => status,
            Err(OrchestratorError::NotFound(_)) => ReplicaStatus::default(),
            Err(e) => return Err(e.into()),
        };
        let deleted = self.orchestrator.delete(&key).await?;
        if deleted {
            info!(%key, "workload deleted");
        } else {
            debug!(%key, "workload already absent");
        }
        self.report_deleted(kind, &target.id, &last_seen);
        Ok(deleted)
    }

    async fn resolve_namespace(&self, kind: ResourceKind, id: &str) -> AgentResult<Option<String>> {
        let managed = self.orchestrator.list_managed().await?;
        Ok(managed
            .into_iter()
            .find(|k| k.kind == kind && k.name == id)
            .map(|k| k.namespace))
    }

    fn report_deleted(&self, kind: ResourceKind, id: &str, last_seen: &ReplicaStatus) {
        match kind {
            ResourceKind::Deployment => {
                for replica in &last_seen.replicas {
                    self.reporter
                        .report(StatusUpdate::Instance(InstanceChange::Delete {
                            deployment_id: id.to_string(),
                            instance_id: replica.name.clone(),
                        }));
                }
            }
            ResourceKind::Sentinel => self.reporter.report(StatusUpdate::Sentinel(gone(id))),
            ResourceKind::Gateway => self.reporter.report(StatusUpdate::Gateway(gone(id))),
        }
    }

    // ── Resync ─────────────────────────────────────────────────────

    /// Ask the control plane about every locally managed workload
    /// (optionally of one kind) and queue each answer into `sink`.
    ///
    /// Resources the control plane no longer wants come back as `Delete`.
    pub async fn resync_local(
        &self,
        plane: &dyn ControlPlane,
        identity: &AgentIdentity,
        kind: Option<ResourceKind>,
        sink: &EventBuffer<InfraEvent>,
    ) -> AgentResult<usize> {
        let keys = self.orchestrator.list_managed().await?;
        let mut queued = 0;
        for key in keys.iter().filter(|k| kind.is_none_or(|want| k.kind == want)) {
            match plane.desired_workload(identity, key.kind, &key.name).await {
                Ok(event) => {
                    sink.push(event);
                    queued += 1;
                }
                Err(e) => warn!(%key, error = %e, "desired state lookup failed"),
            }
        }
        debug!(kind = ?kind, managed = keys.len(), queued, "local workloads resynced");
        Ok(queued)
    }
}

fn workload_spec(
    key: &WorkloadKey,
    image: &str,
    resources: Resources,
    env: BTreeMap<String, String>,
) -> WorkloadSpec {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(KIND_LABEL.to_string(), key.kind.to_string());
    WorkloadSpec {
        image: image.to_string(),
        replicas: resources.replicas,
        cpu_millicores: resources.cpu_millicores,
        memory_mib: resources.memory_mib,
        labels,
        env,
    }
}

/// Hex SHA-256 of the spec's JSON encoding.
pub fn spec_hash(spec: &WorkloadSpec) -> AgentResult<String> {
    let bytes = serde_json::to_vec(spec).map_err(|e| AgentError::Serialize(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn health_of(status: &ReplicaStatus) -> WorkloadHealth {
    let ready = status.ready();
    match (status.desired, ready) {
        (0, _) => WorkloadHealth::Unknown,
        (desired, ready) if ready >= desired => WorkloadHealth::Healthy,
        (_, 0) => WorkloadHealth::Unhealthy,
        _ => WorkloadHealth::Degraded,
    }
}

fn workload_report(id: &str, status: &ReplicaStatus) -> WorkloadReport {
    WorkloadReport {
        id: id.to_string(),
        available_replicas: status.ready(),
        health: health_of(status),
    }
}

fn gone(id: &str) -> WorkloadReport {
    WorkloadReport {
        id: id.to_string(),
        available_replicas: 0,
        health: WorkloadHealth::Unknown,
    }
}
