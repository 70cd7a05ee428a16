//! The workflow's view of the workload plane.

use async_trait::async_trait;
use tracing::debug;

use keel_state::{Deployment, Instance};
use keel_sync::SyncService;

use crate::error::WorkflowResult;

#[async_trait]
pub trait DeploymentPlane: Send + Sync {
    /// Ask the agents to run `deployment` at its desired shape.
    async fn create_workload(&self, deployment: &Deployment) -> WorkflowResult<()>;

    /// Current instances of a deployment as last observed.
    async fn instances(&self, deployment_id: &str) -> WorkflowResult<Vec<Instance>>;
}

/// Drives agents through the sync service: emits the deployment's
/// desired state to matching watchers and reads back the instances they
/// report.
#[derive(Clone)]
pub struct SyncPlane {
    sync: SyncService,
}

impl SyncPlane {
    pub fn new(sync: SyncService) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl DeploymentPlane for SyncPlane {
    async fn create_workload(&self, deployment: &Deployment) -> WorkflowResult<()> {
        let delivered = self.sync.notify_deployment(deployment)?;
        debug!(deployment_id = %deployment.id, delivered, "workload requested");
        Ok(())
    }

    async fn instances(&self, deployment_id: &str) -> WorkflowResult<Vec<Instance>> {
        Ok(self.sync.store().list_instances_for_deployment(deployment_id)?)
    }
}
