//! Container orchestrator abstraction.
//!
//! The reconciler talks to the local orchestrator only through the
//! [`Orchestrator`] trait. [`InMemoryOrchestrator`] keeps workloads in a
//! map, reports every replica ready as soon as it is created, and counts
//! mutations so tests can assert how many calls a reconcile issued.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use keel_state::epoch_secs;
use keel_sync::ResourceKind;

use crate::error::OrchestratorError;

pub const MANAGED_BY_LABEL: &str = "keel.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "keel-agent";
pub const KIND_LABEL: &str = "keel.dev/kind";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub kind: ResourceKind,
    pub namespace: String,
    /// Resource id; orchestrator objects are named after it.
    pub name: String,
}

impl WorkloadKey {
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Desired shape of an orchestrator workload.
///
/// Map fields are ordered so JSON serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub image: String,
    pub replicas: u32,
    pub cpu_millicores: u32,
    pub memory_mib: u32,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub key: WorkloadKey,
    pub spec: WorkloadSpec,
    /// Bumped on every replace.
    pub generation: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub name: String,
    /// `host:port` the replica listens on.
    pub address: String,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicaStatus {
    pub desired: u32,
    pub replicas: Vec<Replica>,
}

impl ReplicaStatus {
    pub fn ready(&self) -> u32 {
        self.replicas.iter().filter(|r| r.ready).count() as u32
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, OrchestratorError>;

    async fn create_namespace(&self, namespace: &str) -> Result<(), OrchestratorError>;

    async fn get(&self, key: &WorkloadKey) -> Result<Option<Workload>, OrchestratorError>;

    /// Fails with `AlreadyExists` if the workload is present.
    async fn create(
        &self,
        key: &WorkloadKey,
        spec: WorkloadSpec,
    ) -> Result<Workload, OrchestratorError>;

    /// Replace the spec in place. Fails with `NotFound` if absent.
    async fn replace(
        &self,
        key: &WorkloadKey,
        spec: WorkloadSpec,
    ) -> Result<Workload, OrchestratorError>;

    /// Returns false if the workload was already absent.
    async fn delete(&self, key: &WorkloadKey) -> Result<bool, OrchestratorError>;

    /// Every workload carrying the managed-by label.
    async fn list_managed(&self) -> Result<Vec<WorkloadKey>, OrchestratorError>;

    async fn replicas(&self, key: &WorkloadKey) -> Result<ReplicaStatus, OrchestratorError>;
}

// ── In-memory implementation ───────────────────────────────────────

#[derive(Default)]
struct Cluster {
    namespaces: BTreeSet<String>,
    workloads: BTreeMap<WorkloadKey, Workload>,
}

/// Mutation counters for an [`InMemoryOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCounts {
    pub namespaces_created: usize,
    pub creates: usize,
    pub replaces: usize,
    pub deletes: usize,
}

impl CallCounts {
    pub fn mutations(&self) -> usize {
        self.creates + self.replaces + self.deletes
    }
}

#[derive(Default)]
pub struct InMemoryOrchestrator {
    cluster: Mutex<Cluster>,
    namespaces_created: AtomicUsize,
    creates: AtomicUsize,
    replaces: AtomicUsize,
    deletes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Cluster>, OrchestratorError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(OrchestratorError::Unavailable(
                "orchestrator api unreachable".to_string(),
            ));
        }
        Ok(self.cluster.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Make every call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            namespaces_created: self.namespaces_created.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            replaces: self.replaces.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of every workload, regardless of labels.
    pub fn workloads(&self) -> Vec<Workload> {
        self.cluster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workloads
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, OrchestratorError> {
        Ok(self.lock()?.namespaces.contains(namespace))
    }

    async fn create_namespace(&self, namespace: &str) -> Result<(), OrchestratorError> {
        if self.lock()?.namespaces.insert(namespace.to_string()) {
            self.namespaces_created.fetch_add(1, Ordering::Relaxed);
            debug!(%namespace, "namespace created");
        }
        Ok(())
    }

    async fn get(&self, key: &WorkloadKey) -> Result<Option<Workload>, OrchestratorError> {
        Ok(self.lock()?.workloads.get(key).cloned())
    }

    async fn create(
        &self,
        key: &WorkloadKey,
        spec: WorkloadSpec,
    ) -> Result<Workload, OrchestratorError> {
        let mut cluster = self.lock()?;
        if !cluster.namespaces.contains(&key.namespace) {
            return Err(OrchestratorError::NotFound(format!(
                "namespace {}",
                key.namespace
            )));
        }
        if cluster.workloads.contains_key(key) {
            return Err(OrchestratorError::AlreadyExists(key.to_string()));
        }
        let workload = Workload {
            key: key.clone(),
            spec,
            generation: 1,
            created_at: epoch_secs(),
        };
        cluster.workloads.insert(key.clone(), workload.clone());
        self.creates.fetch_add(1, Ordering::Relaxed);
        Ok(workload)
    }

    async fn replace(
        &self,
        key: &WorkloadKey,
        spec: WorkloadSpec,
    ) -> Result<Workload, OrchestratorError> {
        let mut cluster = self.lock()?;
        let existing = cluster
            .workloads
            .get_mut(key)
            .ok_or_else(|| OrchestratorError::NotFound(key.to_string()))?;
        existing.spec = spec;
        existing.generation += 1;
        let updated = existing.clone();
        self.replaces.fetch_add(1, Ordering::Relaxed);
        Ok(updated)
    }

    async fn delete(&self, key: &WorkloadKey) -> Result<bool, OrchestratorError> {
        let removed = self.lock()?.workloads.remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn list_managed(&self) -> Result<Vec<WorkloadKey>, OrchestratorError> {
        Ok(self
            .lock()?
            .workloads
            .values()
            .filter(|w| {
                w.spec.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
            })
            .map(|w| w.key.clone())
            .collect())
    }

    async fn replicas(&self, key: &WorkloadKey) -> Result<ReplicaStatus, OrchestratorError> {
        let cluster = self.lock()?;
        let workload = cluster
            .workloads
            .get(key)
            .ok_or_else(|| OrchestratorError::NotFound(key.to_string()))?;
        let replicas = (0..workload.spec.replicas)
            .map(|i| Replica {
                name: format!("{}-{i}", key.name),
                address: format!("{}-{i}.{}.svc:8080", key.name, key.namespace),
                ready: true,
            })
            .collect();
        Ok(ReplicaStatus {
            desired: workload.spec.replicas,
            replicas,
        })
    }
}
