//! DeploymentService — the entry points callers use.
//!
//! Requests are validated before anything is written; a rejected request
//! leaves no trace in the store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use keel_state::{
    Deployment, DeploymentStatus, DesiredState, ProgressEntry, Project, Resources, StateStore,
    epoch_secs,
};

use crate::deploy::{DeploySource, DeployWorkflow};
use crate::error::{WorkflowError, WorkflowResult};

/// A request to deploy into a project environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeployment {
    pub workspace_id: String,
    pub project_id: String,
    pub environment_id: String,
    #[serde(default)]
    pub git_commit_sha: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    pub source: DeploySource,
    pub region: String,
    #[serde(default)]
    pub shard: Option<String>,
    pub resources: Resources,
}

#[derive(Clone)]
pub struct DeploymentService {
    store: StateStore,
    workflow: Arc<DeployWorkflow>,
}

impl DeploymentService {
    pub fn new(store: StateStore, workflow: DeployWorkflow) -> Self {
        Self {
            store,
            workflow: Arc::new(workflow),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Create a deployment and run its workflow to completion.
    pub async fn create_deployment(&self, request: CreateDeployment) -> WorkflowResult<Deployment> {
        let accepted = self.accept(request)?;
        self.workflow.run(&accepted.id).await
    }

    /// Create a deployment and run its workflow in the background.
    /// Returns the accepted `pending` record.
    pub fn submit_deployment(&self, request: CreateDeployment) -> WorkflowResult<Deployment> {
        let accepted = self.accept(request)?;
        let service = self.clone();
        let id = accepted.id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.workflow.run(&id).await {
                warn!(deployment_id = %id, error = %e, "deployment workflow failed");
            }
        });
        Ok(accepted)
    }

    pub async fn promote(&self, deployment_id: &str) -> WorkflowResult<Project> {
        self.workflow.router().promote(deployment_id).await
    }

    pub async fn rollback(&self, source_id: &str, target_id: &str) -> WorkflowResult<Project> {
        self.workflow.router().rollback(source_id, target_id).await
    }

    /// Continue an unfinished deployment from its checkpoints. A deployment
    /// that already finished is returned as is.
    pub async fn resume(&self, deployment_id: &str) -> WorkflowResult<Deployment> {
        let deployment = self.get_deployment(deployment_id)?;
        if deployment.status.is_terminal() {
            return Ok(deployment);
        }
        info!(deployment_id, status = ?deployment.status, "resuming deployment");
        self.workflow.run(deployment_id).await
    }

    /// Resume every deployment left `pending`, `building` or `deploying`.
    /// Returns how many reached `ready`.
    pub async fn resume_incomplete(&self) -> WorkflowResult<usize> {
        let unfinished = self.store.list_deployments_with_status(&[
            DeploymentStatus::Pending,
            DeploymentStatus::Building,
            DeploymentStatus::Deploying,
        ])?;
        if unfinished.is_empty() {
            return Ok(0);
        }
        info!(count = unfinished.len(), "resuming unfinished deployments");

        let mut runs = JoinSet::new();
        for deployment in unfinished {
            let service = self.clone();
            runs.spawn(async move {
                let outcome = service.resume(&deployment.id).await;
                (deployment.id, outcome)
            });
        }

        let mut ready = 0;
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((_, Ok(d))) if d.status == DeploymentStatus::Ready => ready += 1,
                Ok((_, Ok(_))) => {}
                Ok((id, Err(e))) => warn!(deployment_id = %id, error = %e, "resume failed"),
                Err(e) => warn!(error = %e, "resume task panicked"),
            }
        }
        Ok(ready)
    }

    pub fn get_deployment(&self, deployment_id: &str) -> WorkflowResult<Deployment> {
        self.store
            .get_deployment(deployment_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("deployment {deployment_id}")))
    }

    pub fn progress(&self, deployment_id: &str) -> WorkflowResult<Vec<ProgressEntry>> {
        self.get_deployment(deployment_id)?;
        Ok(self.store.list_progress(deployment_id)?)
    }

    /// Validate `request`, insert the deployment and journal the request.
    fn accept(&self, request: CreateDeployment) -> WorkflowResult<Deployment> {
        request.source.validate()?;
        let r = request.resources;
        if r.replicas == 0 || r.cpu_millicores == 0 || r.memory_mib == 0 {
            return Err(WorkflowError::Precondition(
                "replicas, cpu and memory must be positive".into(),
            ));
        }
        if request.region.trim().is_empty() {
            return Err(WorkflowError::Precondition("missing region".into()));
        }

        self.store
            .get_workspace(&request.workspace_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("workspace {}", request.workspace_id)))?;
        let project = self
            .store
            .get_project(&request.project_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("project {}", request.project_id)))?;
        let environment = self
            .store
            .get_environment(&request.environment_id)?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("environment {}", request.environment_id))
            })?;
        if project.workspace_id != request.workspace_id
            || environment.project_id != project.id
        {
            return Err(WorkflowError::Precondition(
                "environment does not belong to project".into(),
            ));
        }

        let now = epoch_secs();
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            workspace_id: request.workspace_id,
            project_id: request.project_id,
            environment_id: request.environment_id,
            git_commit_sha: request.git_commit_sha,
            git_branch: request.git_branch,
            image: None,
            region: request.region,
            shard: request.shard,
            resources: request.resources,
            desired_state: DesiredState::Standby,
            status: DeploymentStatus::Pending,
            openapi_spec: None,
            created_at: now,
            updated_at: now,
        };
        self.workflow.enqueue(&deployment, &request.source)?;
        info!(
            deployment_id = %deployment.id,
            project_id = %deployment.project_id,
            "deployment accepted"
        );
        Ok(deployment)
    }
}
