//! SyncService — desired-state fan-out and observed-state intake.
//!
//! ```text
//!   workflow / API ──notify_*──▶ emit_event(labels, event)
//!                                    │  selector match per agent
//!                                    ▼
//!                     AgentRegistry ─▶ EventBuffer (per client id)
//!                                    │
//!   agent ◀────────── watch ◀────────┘
//!   agent ◀── desired_state (paged full pull from StateStore)
//!   agent ──▶ report (instance/sentinel/gateway/deployment status)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use keel_state::{
    Deployment, Gateway, ListFilter, Page, Sentinel, StateError, StateResult, StateStore,
};

use crate::buffer::BufferConfig;
use crate::control_plane::{AgentIdentity, ControlPlane, EventStream};
use crate::desired::{
    deployment_event, deployment_intent, gateway_event, gateway_intent, labels_for,
    sentinel_event, sentinel_intent,
};
use crate::error::{SyncError, SyncResult};
use crate::event::{
    Change, DeploymentStatusReport, InfraEvent, InstanceChange, Labels, ResourceKind, Selectors,
    StatusUpdate, WorkloadReport,
};
use crate::registry::AgentRegistry;
use crate::selector;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct SyncService {
    store: StateStore,
    registry: Arc<AgentRegistry>,
    page_size: usize,
}

impl SyncService {
    pub fn new(store: StateStore, buffer_config: BufferConfig) -> Self {
        Self {
            store,
            registry: Arc::new(AgentRegistry::new(buffer_config)),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    // ── Fan-out ────────────────────────────────────────────────────

    /// Register the agent and stream its buffered events until the
    /// stream is dropped.
    pub fn watch(&self, client_id: &str, selectors: Selectors) -> EventStream {
        let entry = self.registry.register(client_id, selectors);
        let guard = entry.attach();
        debug!(%client_id, pending = entry.buffer().len(), "watch stream attached");
        Box::pin(stream::unfold(guard, |guard| async move {
            let event = guard.entry().buffer().pop().await;
            Some((Ok(event), guard))
        }))
    }

    /// Deliver `event` to every agent whose selectors match `labels`.
    ///
    /// Never blocks on a slow agent. Returns the number of agents the
    /// event was queued for.
    pub fn emit_event(&self, labels: &Labels, event: &InfraEvent) -> usize {
        let mut delivered = 0;
        for entry in self.registry.snapshot() {
            if !selector::matches(labels, &entry.selectors()) {
                continue;
            }
            if let Some(dropped) = entry.buffer().push(event.clone()) {
                warn!(
                    client_id = %entry.client_id(),
                    dropped_kind = %dropped.kind(),
                    dropped_id = %dropped.resource_id(),
                    "agent buffer full, event dropped"
                );
            }
            delivered += 1;
        }
        debug!(
            kind = %event.kind(),
            resource_id = %event.resource_id(),
            delivered,
            "event emitted"
        );
        delivered
    }

    pub fn notify_deployment(&self, deployment: &Deployment) -> SyncResult<usize> {
        let event = deployment_event(&deployment.id, Some(deployment))?;
        let labels = labels_for(&deployment.region, deployment.shard.as_deref());
        Ok(self.emit_event(&labels, &event))
    }

    pub fn notify_sentinel(&self, sentinel: &Sentinel) -> SyncResult<usize> {
        let event = sentinel_event(&sentinel.id, Some(sentinel))?;
        let labels = labels_for(&sentinel.region, sentinel.shard.as_deref());
        Ok(self.emit_event(&labels, &event))
    }

    pub fn notify_gateway(&self, gateway: &Gateway) -> SyncResult<usize> {
        let event = gateway_event(&gateway.id, Some(gateway))?;
        let labels = labels_for(&gateway.region, gateway.shard.as_deref());
        Ok(self.emit_event(&labels, &event))
    }

    // ── Full pull ──────────────────────────────────────────────────

    /// Stream one `Apply` per running workload in `region` (all regions if
    /// `None`), paging through the store.
    ///
    /// Records that fail validation are skipped with a warning. Dropping
    /// the stream stops the pager.
    pub fn desired_state(&self, region: Option<&str>) -> EventStream {
        let (tx, rx) = mpsc::channel(self.page_size);
        let service = self.clone();
        let filter = ListFilter::running_in(region);
        tokio::spawn(async move {
            if let Err(e) = service.pump_desired_state(&filter, &tx).await {
                warn!(error = %e, "desired state pull failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn pump_desired_state(
        &self,
        filter: &ListFilter,
        tx: &mpsc::Sender<SyncResult<InfraEvent>>,
    ) -> SyncResult<()> {
        let mut sent = 0usize;
        sent += self
            .pump_kind(
                filter,
                tx,
                |f, c, l| self.store.list_deployments(f, c, l),
                |d| deployment_intent(d).map(|i| InfraEvent::Deployment(Change::Apply(i))),
            )
            .await?;
        sent += self
            .pump_kind(
                filter,
                tx,
                |f, c, l| self.store.list_sentinels(f, c, l),
                |s| sentinel_intent(s).map(|i| InfraEvent::Sentinel(Change::Apply(i))),
            )
            .await?;
        sent += self
            .pump_kind(
                filter,
                tx,
                |f, c, l| self.store.list_gateways(f, c, l),
                |g| gateway_intent(g).map(|i| InfraEvent::Gateway(Change::Apply(i))),
            )
            .await?;
        debug!(region = ?filter.region, sent, "desired state streamed");
        Ok(())
    }

    async fn pump_kind<R, L, M>(
        &self,
        filter: &ListFilter,
        tx: &mpsc::Sender<SyncResult<InfraEvent>>,
        list: L,
        map: M,
    ) -> SyncResult<usize>
    where
        L: Fn(&ListFilter, Option<&str>, usize) -> StateResult<Page<R>>,
        M: Fn(&R) -> SyncResult<InfraEvent>,
    {
        let mut cursor: Option<String> = None;
        let mut sent = 0;
        loop {
            let page = list(filter, cursor.as_deref(), self.page_size)?;
            for record in &page.items {
                match map(record) {
                    Ok(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            // Receiver went away; nothing left to do.
                            return Ok(sent);
                        }
                        sent += 1;
                    }
                    Err(e) => warn!(error = %e, "skipping invalid desired record"),
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(sent),
            }
        }
    }

    // ── Point lookups ──────────────────────────────────────────────

    pub fn desired_deployment(&self, id: &str) -> SyncResult<InfraEvent> {
        deployment_event(id, self.store.get_deployment(id)?.as_ref())
    }

    pub fn desired_sentinel(&self, id: &str) -> SyncResult<InfraEvent> {
        sentinel_event(id, self.store.get_sentinel(id)?.as_ref())
    }

    pub fn desired_gateway(&self, id: &str) -> SyncResult<InfraEvent> {
        gateway_event(id, self.store.get_gateway(id)?.as_ref())
    }

    pub fn desired(&self, kind: ResourceKind, id: &str) -> SyncResult<InfraEvent> {
        match kind {
            ResourceKind::Deployment => self.desired_deployment(id),
            ResourceKind::Sentinel => self.desired_sentinel(id),
            ResourceKind::Gateway => self.desired_gateway(id),
        }
    }

    // ── Observed state ─────────────────────────────────────────────

    /// Record an instance change. Replays of an already-known instance
    /// replace the row instead of failing.
    pub fn update_instance_state(&self, change: InstanceChange) -> SyncResult<()> {
        match change {
            InstanceChange::Upsert(instance) => match self.store.insert_instance(&instance) {
                Ok(()) => {
                    debug!(
                        deployment_id = %instance.deployment_id,
                        instance_id = %instance.id,
                        "instance recorded"
                    );
                    Ok(())
                }
                Err(StateError::Duplicate(_)) => {
                    self.store.upsert_instance(&instance)?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            InstanceChange::Delete {
                deployment_id,
                instance_id,
            } => {
                let existed = self.store.delete_instance(&deployment_id, &instance_id)?;
                debug!(%deployment_id, %instance_id, existed, "instance removed");
                Ok(())
            }
        }
    }

    pub fn update_sentinel_state(&self, report: WorkloadReport) -> SyncResult<()> {
        self.store
            .update_sentinel_observed(&report.id, report.available_replicas, report.health)?;
        debug!(sentinel_id = %report.id, available = report.available_replicas, health = ?report.health, "sentinel state updated");
        Ok(())
    }

    pub fn update_gateway_state(&self, report: WorkloadReport) -> SyncResult<()> {
        self.store
            .update_gateway_observed(&report.id, report.available_replicas, report.health)?;
        debug!(gateway_id = %report.id, available = report.available_replicas, health = ?report.health, "gateway state updated");
        Ok(())
    }

    pub fn update_deployment_status(&self, report: DeploymentStatusReport) -> SyncResult<()> {
        let current = self
            .store
            .get_deployment(&report.deployment_id)?
            .ok_or_else(|| SyncError::NotFound(format!("deployment {}", report.deployment_id)))?;
        if current.status == report.status {
            return Ok(());
        }
        self.store
            .update_deployment_status(&report.deployment_id, report.status)?;
        info!(
            deployment_id = %report.deployment_id,
            from = ?current.status,
            to = ?report.status,
            "deployment status reported by agent"
        );
        Ok(())
    }

    pub fn report(&self, update: StatusUpdate) -> SyncResult<()> {
        match update {
            StatusUpdate::Instance(change) => self.update_instance_state(change),
            StatusUpdate::Sentinel(report) => self.update_sentinel_state(report),
            StatusUpdate::Gateway(report) => self.update_gateway_state(report),
            StatusUpdate::Deployment(report) => self.update_deployment_status(report),
        }
    }
}

#[async_trait]
impl ControlPlane for SyncService {
    async fn watch(&self, identity: &AgentIdentity) -> SyncResult<EventStream> {
        Ok(SyncService::watch(
            self,
            &identity.client_id,
            identity.selectors.clone(),
        ))
    }

    async fn desired_state(&self, identity: &AgentIdentity) -> SyncResult<EventStream> {
        Ok(SyncService::desired_state(self, identity.region_selector()))
    }

    async fn desired_workload(
        &self,
        _identity: &AgentIdentity,
        kind: ResourceKind,
        id: &str,
    ) -> SyncResult<InfraEvent> {
        self.desired(kind, id)
    }

    async fn report(&self, _identity: &AgentIdentity, update: StatusUpdate) -> SyncResult<()> {
        SyncService::report(self, update)
    }
}
