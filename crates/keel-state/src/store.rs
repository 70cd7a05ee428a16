//! StateStore — redb-backed persistence for the Keel control plane.
//!
//! Provides typed CRUD over control-plane records, cursor-paginated
//! listings of desired workloads, strict inserts for idempotency checks,
//! and [`StateStore::atomically`] for multi-row all-or-nothing updates.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

/// A single write transaction handed to [`StateStore::atomically`].
///
/// Every change made through it commits together or not at all.
pub struct StoreTxn<'a> {
    txn: &'a WriteTransaction,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [
            WORKSPACES,
            PROJECTS,
            ENVIRONMENTS,
            DEPLOYMENTS,
            INSTANCES,
            SENTINELS,
            GATEWAYS,
            DOMAINS,
            PROGRESS,
            CHECKPOINTS,
        ] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error aborts
    /// every write `f` made.
    pub fn atomically<T, F>(&self, f: F) -> StateResult<T>
    where
        F: FnOnce(&StoreTxn<'_>) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = f(&StoreTxn { txn: &txn });
        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "failed to abort transaction");
                }
                Err(e)
            }
        }
    }

    // ── Generic row access ─────────────────────────────────────────

    fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let row = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(row)
    }

    fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        self.atomically(|txn| txn.put(record))
    }

    fn insert<R: Record>(&self, record: &R) -> StateResult<()> {
        self.atomically(|txn| txn.insert(record))
    }

    /// Rows whose key starts with `prefix`, in key order.
    fn scan<R: Record>(&self, prefix: &str) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// One page of rows matching `filter`, starting after `cursor`.
    fn page<R: DesiredRecord>(
        &self,
        filter: &ListFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> StateResult<Page<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut items = Vec::new();
        let mut last_key = None;
        let mut exhausted = true;

        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if cursor.is_some_and(|c| key <= c) {
                continue;
            }
            if items.len() >= limit {
                exhausted = false;
                break;
            }
            last_key = Some(key.to_string());
            let record: R = decode(value.value())?;
            if filter.matches(&record) {
                items.push(record);
            }
        }

        Ok(Page {
            items,
            next_cursor: if exhausted { None } else { last_key },
        })
    }

    // ── Tenancy ────────────────────────────────────────────────────

    pub fn put_workspace(&self, workspace: &Workspace) -> StateResult<()> {
        self.put(workspace)
    }

    pub fn get_workspace(&self, id: &str) -> StateResult<Option<Workspace>> {
        self.get(id)
    }

    pub fn put_project(&self, project: &Project) -> StateResult<()> {
        self.put(project)
    }

    pub fn get_project(&self, id: &str) -> StateResult<Option<Project>> {
        self.get(id)
    }

    pub fn put_environment(&self, environment: &Environment) -> StateResult<()> {
        self.put(environment)
    }

    pub fn get_environment(&self, id: &str) -> StateResult<Option<Environment>> {
        self.get(id)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert a new deployment. Fails with `Duplicate` if the id is taken.
    pub fn insert_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.insert(deployment)?;
        debug!(deployment_id = %deployment.id, "deployment inserted");
        Ok(())
    }

    /// Insert or replace a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(deployment)
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get(id)
    }

    /// Page through deployments matching `filter`, in id order.
    pub fn list_deployments(
        &self,
        filter: &ListFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> StateResult<Page<Deployment>> {
        self.page(filter, cursor, limit)
    }

    /// All deployments whose observed status is one of `statuses`.
    pub fn list_deployments_with_status(
        &self,
        statuses: &[DeploymentStatus],
    ) -> StateResult<Vec<Deployment>> {
        let all: Vec<Deployment> = self.scan("")?;
        Ok(all
            .into_iter()
            .filter(|d| statuses.contains(&d.status))
            .collect())
    }

    /// Apply `change` to an existing deployment and persist it.
    ///
    /// Fails with `NotFound` if the deployment does not exist.
    pub fn update_deployment<F>(&self, id: &str, change: F) -> StateResult<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        self.atomically(|txn| {
            let mut deployment: Deployment = txn
                .get(id)?
                .ok_or_else(|| StateError::NotFound(format!("deployment {id}")))?;
            change(&mut deployment);
            deployment.updated_at = epoch_secs();
            txn.put(&deployment)?;
            Ok(deployment)
        })
    }

    /// Conditionally set a deployment's observed status.
    pub fn update_deployment_status(
        &self,
        id: &str,
        status: DeploymentStatus,
    ) -> StateResult<Deployment> {
        let deployment = self.update_deployment(id, |d| d.status = status)?;
        debug!(deployment_id = %id, ?status, "deployment status updated");
        Ok(deployment)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert a new instance. Fails with `Duplicate` if it already exists.
    pub fn insert_instance(&self, instance: &Instance) -> StateResult<()> {
        self.insert(instance)
    }

    /// Replace the full instance row, creating it if absent.
    pub fn upsert_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(instance)
    }

    pub fn get_instance(
        &self,
        deployment_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<Instance>> {
        self.get(&instance_key(deployment_id, instance_id))
    }

    pub fn list_instances_for_deployment(&self, deployment_id: &str) -> StateResult<Vec<Instance>> {
        self.scan(&format!("{deployment_id}:"))
    }

    /// Delete an instance. Returns true if it existed.
    pub fn delete_instance(&self, deployment_id: &str, instance_id: &str) -> StateResult<bool> {
        let key = instance_key(deployment_id, instance_id);
        self.atomically(|txn| txn.delete::<Instance>(&key))
    }

    // ── Sentinels ──────────────────────────────────────────────────

    pub fn put_sentinel(&self, sentinel: &Sentinel) -> StateResult<()> {
        self.put(sentinel)
    }

    pub fn get_sentinel(&self, id: &str) -> StateResult<Option<Sentinel>> {
        self.get(id)
    }

    pub fn list_sentinels(
        &self,
        filter: &ListFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> StateResult<Page<Sentinel>> {
        self.page(filter, cursor, limit)
    }

    /// Record observed replica count and health for a sentinel.
    pub fn update_sentinel_observed(
        &self,
        id: &str,
        available_replicas: u32,
        health: WorkloadHealth,
    ) -> StateResult<Sentinel> {
        self.atomically(|txn| {
            let mut sentinel: Sentinel = txn
                .get(id)?
                .ok_or_else(|| StateError::NotFound(format!("sentinel {id}")))?;
            sentinel.available_replicas = available_replicas;
            sentinel.health = health;
            sentinel.updated_at = epoch_secs();
            txn.put(&sentinel)?;
            Ok(sentinel)
        })
    }

    // ── Gateways ───────────────────────────────────────────────────

    pub fn put_gateway(&self, gateway: &Gateway) -> StateResult<()> {
        self.put(gateway)
    }

    pub fn get_gateway(&self, id: &str) -> StateResult<Option<Gateway>> {
        self.get(id)
    }

    pub fn list_gateways(
        &self,
        filter: &ListFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> StateResult<Page<Gateway>> {
        self.page(filter, cursor, limit)
    }

    /// Record observed replica count and health for a gateway.
    pub fn update_gateway_observed(
        &self,
        id: &str,
        available_replicas: u32,
        health: WorkloadHealth,
    ) -> StateResult<Gateway> {
        self.atomically(|txn| {
            let mut gateway: Gateway = txn
                .get(id)?
                .ok_or_else(|| StateError::NotFound(format!("gateway {id}")))?;
            gateway.available_replicas = available_replicas;
            gateway.health = health;
            gateway.updated_at = epoch_secs();
            txn.put(&gateway)?;
            Ok(gateway)
        })
    }

    // ── Domains ────────────────────────────────────────────────────

    pub fn get_domain(&self, hostname: &str) -> StateResult<Option<Domain>> {
        self.get(hostname)
    }

    /// Insert a new domain. Fails with `Duplicate` if the hostname exists.
    pub fn insert_domain(&self, domain: &Domain) -> StateResult<()> {
        self.insert(domain)
    }

    /// Domains of a project/environment whose stickiness is in `sticky`.
    pub fn list_domains_for_environment(
        &self,
        project_id: &str,
        environment_id: &str,
        sticky: &[Sticky],
    ) -> StateResult<Vec<Domain>> {
        let all: Vec<Domain> = self.scan("")?;
        Ok(all
            .into_iter()
            .filter(|d| {
                d.project_id == project_id
                    && d.environment_id == environment_id
                    && sticky.contains(&d.sticky)
            })
            .collect())
    }

    pub fn list_domains_for_deployment(&self, deployment_id: &str) -> StateResult<Vec<Domain>> {
        let all: Vec<Domain> = self.scan("")?;
        Ok(all
            .into_iter()
            .filter(|d| d.deployment_id == deployment_id)
            .collect())
    }

    // ── Progress log ───────────────────────────────────────────────

    /// Append a progress entry for a deployment and return its sequence number.
    pub fn append_progress(
        &self,
        deployment_id: &str,
        phase: ProgressPhase,
        message: &str,
    ) -> StateResult<u64> {
        let prefix = format!("{deployment_id}:");
        self.atomically(|txn| {
            let seq = txn.count_prefix::<ProgressEntry>(&prefix)? as u64;
            txn.put(&ProgressEntry {
                deployment_id: deployment_id.to_string(),
                seq,
                phase,
                message: message.to_string(),
                at: epoch_secs(),
            })?;
            Ok(seq)
        })
    }

    pub fn list_progress(&self, deployment_id: &str) -> StateResult<Vec<ProgressEntry>> {
        self.scan(&format!("{deployment_id}:"))
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Persisted result of a completed workflow step, if any.
    pub fn get_checkpoint(&self, workflow_key: &str, step: &str) -> StateResult<Option<Vec<u8>>> {
        let key = checkpoint_key(workflow_key, step);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        let value = table
            .get(key.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Persist the result of a completed workflow step.
    pub fn put_checkpoint(&self, workflow_key: &str, step: &str, value: &[u8]) -> StateResult<()> {
        self.atomically(|txn| txn.put_checkpoint(workflow_key, step, value))
    }

    /// Names of the steps already checkpointed for a workflow.
    pub fn list_checkpoints(&self, workflow_key: &str) -> StateResult<Vec<String>> {
        let prefix = checkpoint_key(workflow_key, "");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        let mut steps = Vec::new();
        for entry in table
            .range::<&str>(prefix.as_str()..)
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            match key.value().strip_prefix(&prefix) {
                Some(step) => steps.push(step.to_string()),
                None => break,
            }
        }
        Ok(steps)
    }
}

impl StoreTxn<'_> {
    /// Read a row inside the transaction (sees this transaction's writes).
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let row = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(row)
    }

    /// Insert or replace a row.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Insert a row, failing with `Duplicate` if the key is taken.
    pub fn insert<R: Record>(&self, record: &R) -> StateResult<()> {
        let key = record.table_key();
        if self.get::<R>(&key)?.is_some() {
            return Err(StateError::Duplicate(key));
        }
        self.put(record)
    }

    /// Delete a row. Returns true if it existed.
    pub fn delete<R: Record>(&self, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    fn count_prefix<R: Record>(&self, prefix: &str) -> StateResult<usize> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut count = 0;
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Persist a workflow step result alongside the other writes of this
    /// transaction.
    pub fn put_checkpoint(&self, workflow_key: &str, step: &str, value: &[u8]) -> StateResult<()> {
        let key = checkpoint_key(workflow_key, step);
        let mut table = self.txn.open_table(CHECKPOINTS).map_err(map_err!(Table))?;
        table.insert(key.as_str(), value).map_err(map_err!(Write))?;
        Ok(())
    }
}

fn decode<R: Record>(bytes: &[u8]) -> StateResult<R> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn checkpoint_key(workflow_key: &str, step: &str) -> String {
    format!("{workflow_key}/{step}")
}
