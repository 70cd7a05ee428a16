//! DeployWorkflow — one deployment, end to end, as checkpointed steps.
//!
//! ```text
//! load ─► [create_build ─► build] ─► create_workload ─► wait_ready ─► fetch_schema
//!                                                                         │
//!        complete ◄─ finalize ◄─ switch_routing ◄─ domains ◄─ (project lock)
//! ```
//!
//! Every step's result is journaled under `deploy/{deployment_id}`; a
//! re-run replays finished steps and continues at the first unfinished
//! one. A guard marks the deployment `failed` when a run ends in an error
//! or a panic. A cancelled run keeps its status so it can be resumed.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use keel_state::{
    Deployment, DeploymentStatus, DesiredState, Environment, Instance, InstanceStatus,
    ProgressPhase, Project, StateStore, epoch_secs,
};

use crate::builder::{BuildContext, BuildTicket, Builder, wait_for_build};
use crate::domains::{DomainInputs, DomainSpec, domain_set};
use crate::durable::Execution;
use crate::error::{WorkflowError, WorkflowResult};
use crate::plane::DeploymentPlane;
use crate::routing::{DomainChange, DomainRouter, gateway_configs};
use crate::schema::{SchemaFetcher, fetch_first};

/// Journal entry holding the deploy request.
pub const REQUEST_STEP: &str = "request";

/// What to run: a prebuilt image or source to build first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DeploySource {
    Image { image: String },
    Build(BuildContext),
}

impl DeploySource {
    pub fn validate(&self) -> WorkflowResult<()> {
        match self {
            DeploySource::Image { image } if image.trim().is_empty() => {
                Err(WorkflowError::Precondition("missing image".into()))
            }
            DeploySource::Build(context) if context.context_url.trim().is_empty() => {
                Err(WorkflowError::Precondition("missing build context".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Tuning for the deploy workflow.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Apex every generated hostname lives under.
    pub apex_domain: String,
    pub instance_poll_interval: Duration,
    /// Polls before a deployment whose instances never all run fails.
    pub max_instance_polls: u32,
    /// Log progress every this many polls.
    pub poll_log_every: u32,
    pub build_poll_interval: Duration,
    pub max_build_polls: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            apex_domain: "keel.app".to_string(),
            instance_poll_interval: Duration::from_secs(1),
            max_instance_polls: 300,
            poll_log_every: 10,
            build_poll_interval: Duration::from_secs(2),
            max_build_polls: 900,
        }
    }
}

impl WorkflowConfig {
    pub fn with_apex_domain(mut self, apex: &str) -> Self {
        self.apex_domain = apex.to_string();
        self
    }

    pub fn with_instance_polls(mut self, interval: Duration, max_polls: u32) -> Self {
        self.instance_poll_interval = interval;
        self.max_instance_polls = max_polls;
        self
    }

    pub fn with_poll_log_every(mut self, every: u32) -> Self {
        self.poll_log_every = every;
        self
    }

    pub fn with_build_polls(mut self, interval: Duration, max_polls: u32) -> Self {
        self.build_poll_interval = interval;
        self.max_build_polls = max_polls;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Tenancy {
    workspace_slug: String,
    project_slug: String,
    environment_slug: String,
}

/// Marks the deployment failed when the run ends in an error or a panic.
///
/// A run that is cancelled (its future dropped, as on shutdown) leaves the
/// deployment in its current state so a later resume picks it up.
struct FailureGuard {
    store: StateStore,
    deployment_id: String,
    reason: Option<String>,
    armed: bool,
}

impl FailureGuard {
    fn arm(store: StateStore, deployment_id: &str) -> Self {
        Self {
            store,
            deployment_id: deployment_id.to_string(),
            reason: None,
            armed: true,
        }
    }

    fn fail(&mut self, reason: String) {
        self.reason = Some(reason);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailureGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = match self.reason.take() {
            Some(reason) => reason,
            None if std::thread::panicking() => "deployment workflow panicked".to_string(),
            None => {
                info!(deployment_id = %self.deployment_id, "deployment workflow interrupted, left for resume");
                return;
            }
        };

        match self
            .store
            .update_deployment_status(&self.deployment_id, DeploymentStatus::Failed)
        {
            Ok(_) => warn!(deployment_id = %self.deployment_id, %reason, "deployment failed"),
            Err(e) => {
                error!(deployment_id = %self.deployment_id, error = %e, "could not mark deployment failed");
            }
        }
        if let Err(e) =
            self.store
                .append_progress(&self.deployment_id, ProgressPhase::Failed, &reason)
        {
            error!(deployment_id = %self.deployment_id, error = %e, "could not record failure");
        }
    }
}

/// Runs deployments.
pub struct DeployWorkflow {
    store: StateStore,
    router: DomainRouter,
    plane: Arc<dyn DeploymentPlane>,
    schema: Arc<dyn SchemaFetcher>,
    builder: Option<Arc<dyn Builder>>,
    config: WorkflowConfig,
}

impl DeployWorkflow {
    pub fn new(
        store: StateStore,
        router: DomainRouter,
        plane: Arc<dyn DeploymentPlane>,
        schema: Arc<dyn SchemaFetcher>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            store,
            router,
            plane,
            schema,
            builder: None,
            config,
        }
    }

    pub fn with_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn router(&self) -> &DomainRouter {
        &self.router
    }

    pub fn workflow_key(deployment_id: &str) -> String {
        format!("deploy/{deployment_id}")
    }

    fn execution(&self, deployment_id: &str) -> Execution {
        Execution::new(
            Arc::new(self.store.clone()),
            &Self::workflow_key(deployment_id),
        )
    }

    /// Insert a new deployment together with the request a later
    /// [`run`](Self::run) executes. Both rows commit in one transaction.
    pub fn enqueue(&self, deployment: &Deployment, source: &DeploySource) -> WorkflowResult<()> {
        let key = Self::workflow_key(&deployment.id);
        let bytes = serde_json::to_vec(source)
            .map_err(|e| WorkflowError::Checkpoint(format!("{key}/{REQUEST_STEP}: {e}")))?;
        self.store.atomically(|txn| {
            txn.insert(deployment)?;
            txn.put_checkpoint(&key, REQUEST_STEP, &bytes)
        })?;
        Ok(())
    }

    pub fn recorded_request(&self, deployment_id: &str) -> WorkflowResult<Option<DeploySource>> {
        self.execution(deployment_id).recorded(REQUEST_STEP)
    }

    /// Run (or resume) the workflow for a deployment whose request has
    /// been recorded.
    pub async fn run(&self, deployment_id: &str) -> WorkflowResult<Deployment> {
        let exec = self.execution(deployment_id);
        let mut guard = FailureGuard::arm(self.store.clone(), deployment_id);
        let outcome = match exec.recorded::<DeploySource>(REQUEST_STEP) {
            Ok(Some(source)) => self.execute(&exec, deployment_id, &source).await,
            Ok(None) => Err(WorkflowError::NotFound(format!(
                "no deploy request recorded for {deployment_id}"
            ))),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(deployment) => {
                guard.disarm();
                info!(
                    deployment_id,
                    executed = exec.executed(),
                    replayed = exec.replayed(),
                    "deployment ready"
                );
                Ok(deployment)
            }
            Err(e) => {
                guard.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        exec: &Execution,
        id: &str,
        source: &DeploySource,
    ) -> WorkflowResult<Deployment> {
        let tenancy: Tenancy = exec.step("load", || self.load(id)).await?;

        let image = match source {
            DeploySource::Image { image } => image.clone(),
            DeploySource::Build(context) => {
                let ticket: BuildTicket = exec
                    .step("create_build", || self.start_build(id, context))
                    .await?;
                exec.step("build", || self.await_build(id, &ticket)).await?
            }
        };

        exec.step("create_workload", || self.create_workload(id, &image))
            .await?;
        let instances: Vec<Instance> = exec.step("wait_ready", || self.wait_ready(id)).await?;
        let _: bool = exec
            .step("fetch_schema", || self.fetch_schema(id, &instances))
            .await?;

        let deployment = self.deployment(id)?;
        let _lock = self.router.locks().lock(&deployment.project_id).await;

        let specs: Vec<DomainSpec> = exec
            .step("domains", || {
                let inputs = DomainInputs {
                    project: &tenancy.project_slug,
                    workspace: &tenancy.workspace_slug,
                    environment: &tenancy.environment_slug,
                    git_commit_sha: deployment.git_commit_sha.as_deref(),
                    git_branch: deployment.git_branch.as_deref(),
                };
                std::future::ready(Ok(domain_set(&inputs, &self.config.apex_domain)))
            })
            .await?;
        let _: Vec<String> = exec
            .step("switch_routing", || self.switch_routing(id, &specs, &instances))
            .await?;
        let _: bool = exec.step("finalize", || self.finalize(id)).await?;
        exec.step("complete", || self.complete(id)).await?;

        self.deployment(id)
    }

    // ── Steps ──────────────────────────────────────────────────────

    async fn load(&self, id: &str) -> WorkflowResult<Tenancy> {
        let deployment = self.deployment(id)?;
        let workspace = self
            .store
            .get_workspace(&deployment.workspace_id)?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("workspace {}", deployment.workspace_id))
            })?;
        let project = self.project(&deployment.project_id)?;
        let environment = self.environment(&deployment.environment_id)?;

        self.store
            .append_progress(id, ProgressPhase::Pending, "deployment queued")?;
        Ok(Tenancy {
            workspace_slug: workspace.slug,
            project_slug: project.slug,
            environment_slug: environment.slug,
        })
    }

    async fn start_build(&self, id: &str, context: &BuildContext) -> WorkflowResult<BuildTicket> {
        let builder = self.builder()?;
        let deployment = self
            .store
            .update_deployment_status(id, DeploymentStatus::Building)?;
        self.store
            .append_progress(id, ProgressPhase::Building, "building image")?;
        let ticket = builder.create_build(&deployment.project_id, context).await?;
        info!(deployment_id = %id, build_id = %ticket.build_id, "build started");
        Ok(ticket)
    }

    async fn await_build(&self, id: &str, ticket: &BuildTicket) -> WorkflowResult<String> {
        let builder = self.builder()?;
        let image = wait_for_build(
            builder.as_ref(),
            ticket,
            self.config.build_poll_interval,
            self.config.max_build_polls,
        )
        .await?;
        self.store
            .append_progress(id, ProgressPhase::Building, &format!("built {image}"))?;
        Ok(image)
    }

    async fn create_workload(&self, id: &str, image: &str) -> WorkflowResult<()> {
        let deployment = self.store.update_deployment(id, |d| {
            d.status = DeploymentStatus::Deploying;
            d.desired_state = DesiredState::Running;
            d.image = Some(image.to_string());
        })?;
        self.store.append_progress(
            id,
            ProgressPhase::Deploying,
            &format!("starting {} instance(s)", deployment.resources.replicas),
        )?;
        self.plane.create_workload(&deployment).await
    }

    async fn wait_ready(&self, id: &str) -> WorkflowResult<Vec<Instance>> {
        let desired = self.deployment(id)?.resources.replicas as usize;
        let log_every = self.config.poll_log_every.max(1);

        for attempt in 1..=self.config.max_instance_polls {
            let instances = self.plane.instances(id).await?;
            for instance in &instances {
                self.store.upsert_instance(instance)?;
            }

            let running = instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Running)
                .count();
            if running > 0 && running == instances.len() && running >= desired {
                info!(deployment_id = %id, running, attempt, "all instances running");
                return Ok(instances);
            }
            if attempt % log_every == 0 {
                info!(
                    deployment_id = %id,
                    attempt,
                    running,
                    total = instances.len(),
                    "waiting for instances"
                );
            }
            tokio::time::sleep(self.config.instance_poll_interval).await;
        }

        Err(WorkflowError::Timeout(format!(
            "instances of {id} not running after {} polls",
            self.config.max_instance_polls
        )))
    }

    async fn fetch_schema(&self, id: &str, instances: &[Instance]) -> WorkflowResult<bool> {
        let addresses: Vec<String> = instances.iter().map(|i| i.address.clone()).collect();
        match fetch_first(self.schema.as_ref(), &addresses).await {
            Some(schema) => {
                self.store
                    .update_deployment(id, |d| d.openapi_spec = Some(schema))?;
                info!(deployment_id = %id, "openapi schema found");
                Ok(true)
            }
            None => {
                debug!(deployment_id = %id, "no openapi schema served");
                Ok(false)
            }
        }
    }

    async fn switch_routing(
        &self,
        id: &str,
        specs: &[DomainSpec],
        instances: &[Instance],
    ) -> WorkflowResult<Vec<String>> {
        let deployment = self.deployment(id)?;
        let project = self.project(&deployment.project_id)?;
        let environment = self.environment(&deployment.environment_id)?;
        self.store
            .append_progress(id, ProgressPhase::Network, "assigning domains")?;

        let changes = self
            .router
            .plan(&deployment, specs, project.is_rolled_back)?;
        let configs = gateway_configs(
            &deployment,
            instances,
            &environment,
            changes.iter().map(DomainChange::hostname),
        );
        self.router
            .switch_routing(&deployment, &changes, &configs)?;

        Ok(changes.iter().map(|c| c.hostname().to_string()).collect())
    }

    /// Mark ready and, unless the project is rolled back, make this the
    /// live deployment. Returns whether the live pointer moved.
    async fn finalize(&self, id: &str) -> WorkflowResult<bool> {
        let deployment = self
            .store
            .update_deployment_status(id, DeploymentStatus::Ready)?;
        let mut project = self.project(&deployment.project_id)?;
        if project.is_rolled_back {
            info!(deployment_id = %id, project_id = %project.id, "project rolled back, live deployment unchanged");
            return Ok(false);
        }
        project.live_deployment_id = Some(id.to_string());
        project.updated_at = epoch_secs();
        self.store.put_project(&project)?;
        Ok(true)
    }

    async fn complete(&self, id: &str) -> WorkflowResult<()> {
        self.store
            .append_progress(id, ProgressPhase::Completed, "deployment ready")?;
        Ok(())
    }

    // ── Lookups ────────────────────────────────────────────────────

    fn builder(&self) -> WorkflowResult<&Arc<dyn Builder>> {
        self.builder.as_ref().ok_or_else(|| {
            WorkflowError::Precondition("source build requested but no builder is configured".into())
        })
    }

    fn deployment(&self, id: &str) -> WorkflowResult<Deployment> {
        self.store
            .get_deployment(id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("deployment {id}")))
    }

    fn project(&self, id: &str) -> WorkflowResult<Project> {
        self.store
            .get_project(id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("project {id}")))
    }

    fn environment(&self, id: &str) -> WorkflowResult<Environment> {
        self.store
            .get_environment(id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("environment {id}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use keel_state::{RoutingStore, Sticky};

    use super::*;
    use crate::builder::BuildStatus;
    use crate::routing::tests::{deployment, instance, seed_tenancy};

    /// Instances come up after `ready_after` polls.
    pub(crate) struct FakePlane {
        pub creates: AtomicU32,
        pub polls: AtomicU32,
        pub ready_after: AtomicU32,
        requested: Mutex<HashMap<String, u32>>,
    }

    impl FakePlane {
        pub(crate) fn ready_after(polls: u32) -> Self {
            Self {
                creates: AtomicU32::new(0),
                polls: AtomicU32::new(0),
                ready_after: AtomicU32::new(polls),
                requested: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl DeploymentPlane for FakePlane {
        async fn create_workload(&self, deployment: &Deployment) -> WorkflowResult<()> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.requested
                .lock()
                .unwrap()
                .insert(deployment.id.clone(), deployment.resources.replicas);
            Ok(())
        }

        async fn instances(&self, deployment_id: &str) -> WorkflowResult<Vec<Instance>> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            let replicas = self
                .requested
                .lock()
                .unwrap()
                .get(deployment_id)
                .copied()
                .unwrap_or(0);
            let status = if polls > self.ready_after.load(Ordering::SeqCst) {
                InstanceStatus::Running
            } else {
                InstanceStatus::Provisioning
            };
            Ok((0..replicas)
                .map(|i| instance(deployment_id, &format!("{deployment_id}-{i}"), status))
                .collect())
        }
    }

    pub(crate) struct FixedSchema(pub Option<String>);

    #[async_trait]
    impl SchemaFetcher for FixedSchema {
        async fn fetch(&self, _address: &str) -> Option<String> {
            self.0.clone()
        }
    }

    struct FakeBuilder {
        builds: AtomicU32,
        outcome: BuildStatus,
    }

    #[async_trait]
    impl Builder for FakeBuilder {
        async fn create_build(
            &self,
            project_id: &str,
            _context: &BuildContext,
        ) -> WorkflowResult<BuildTicket> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BuildTicket {
                build_id: format!("b-{n}"),
                image: format!("registry.local/{project_id}:b-{n}"),
            })
        }

        async fn build_status(&self, _build_id: &str) -> WorkflowResult<BuildStatus> {
            Ok(self.outcome.clone())
        }
    }

    struct Harness {
        store: StateStore,
        routing: RoutingStore,
        plane: Arc<FakePlane>,
        workflow: DeployWorkflow,
    }

    fn harness(plane: FakePlane, schema: Option<&str>, config: WorkflowConfig) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let routing = RoutingStore::open_in_memory("us-east-1").unwrap();
        seed_tenancy(&store);
        let plane = Arc::new(plane);
        let workflow = DeployWorkflow::new(
            store.clone(),
            DomainRouter::new(store.clone(), routing.clone()),
            plane.clone(),
            Arc::new(FixedSchema(schema.map(str::to_string))),
            config,
        );
        Harness {
            store,
            routing,
            plane,
            workflow,
        }
    }

    fn fast() -> WorkflowConfig {
        WorkflowConfig::default()
            .with_instance_polls(Duration::from_secs(1), 20)
            .with_build_polls(Duration::from_secs(1), 5)
    }

    fn queue(h: &Harness, id: &str, source: DeploySource) {
        let mut record = deployment(id, DeploymentStatus::Pending);
        record.desired_state = DesiredState::Standby;
        record.image = None;
        h.workflow.enqueue(&record, &source).unwrap();
    }

    fn image(name: &str) -> DeploySource {
        DeploySource::Image { image: name.into() }
    }

    fn phases(store: &StateStore, id: &str) -> Vec<ProgressPhase> {
        store
            .list_progress(id)
            .unwrap()
            .into_iter()
            .map(|p| p.phase)
            .collect()
    }

    #[test]
    fn source_validation() {
        assert!(image("").validate().is_err());
        assert!(image("nginx:1").validate().is_ok());
        let build = DeploySource::Build(BuildContext {
            context_url: " ".into(),
            dockerfile: None,
        });
        assert_eq!(build.validate().unwrap_err().to_string(), "missing build context");
    }

    #[tokio::test(start_paused = true)]
    async fn deploys_image_end_to_end() {
        let h = harness(
            FakePlane::ready_after(2),
            Some("openapi: 3.0.0"),
            fast(),
        );
        queue(&h, "d-1", image("registry.local/shop:1"));

        let deployment = h.workflow.run("d-1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Ready);
        assert_eq!(deployment.desired_state, DesiredState::Running);
        assert_eq!(deployment.image.as_deref(), Some("registry.local/shop:1"));
        assert_eq!(deployment.openapi_spec.as_deref(), Some("openapi: 3.0.0"));
        assert_eq!(h.plane.creates.load(Ordering::SeqCst), 1);

        let project = h.store.get_project("proj-1").unwrap().unwrap();
        assert_eq!(project.live_deployment_id.as_deref(), Some("d-1"));

        let env_domain = h
            .store
            .get_domain("shop-production-acme.keel.app")
            .unwrap()
            .unwrap();
        assert_eq!(env_domain.deployment_id, "d-1");
        assert_eq!(env_domain.sticky, Sticky::Environment);

        let config = h
            .routing
            .get_config("shop-git-abc1234-acme.keel.app")
            .unwrap()
            .unwrap();
        assert_eq!(config.instances, vec!["d-1-0.ws-1.svc:8080"]);
        assert!(config.validation.is_some());
        assert_eq!(h.routing.list_for_deployment("d-1").unwrap().len(), 3);

        assert_eq!(
            phases(&h.store, "d-1"),
            vec![
                ProgressPhase::Pending,
                ProgressPhase::Deploying,
                ProgressPhase::Network,
                ProgressPhase::Completed,
            ]
        );
        assert_eq!(
            h.store.get_instance("d-1", "d-1-0").unwrap().unwrap().status,
            InstanceStatus::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_skips_completed_steps() {
        let h = harness(
            FakePlane::ready_after(u32::MAX),
            None,
            WorkflowConfig::default().with_instance_polls(Duration::from_secs(1), 3),
        );
        queue(&h, "d-1", image("registry.local/shop:1"));

        let err = h.workflow.run("d-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Timeout(_)));
        assert_eq!(
            h.store.get_deployment("d-1").unwrap().unwrap().status,
            DeploymentStatus::Failed
        );
        // Partial progress was recorded on every tick.
        assert_eq!(
            h.store.get_instance("d-1", "d-1-0").unwrap().unwrap().status,
            InstanceStatus::Provisioning
        );

        h.plane.ready_after.store(0, Ordering::SeqCst);
        let deployment = h.workflow.run("d-1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Ready);
        assert_eq!(h.plane.creates.load(Ordering::SeqCst), 1);
        assert_eq!(
            phases(&h.store, "d-1")
                .iter()
                .filter(|p| **p == ProgressPhase::Pending)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_run_stays_resumable() {
        let h = harness(FakePlane::ready_after(u32::MAX), None, fast());
        queue(&h, "d-1", image("registry.local/shop:1"));

        // Cancelled mid wait_ready, as a shutdown would.
        let outcome = tokio::time::timeout(Duration::from_secs(5), h.workflow.run("d-1")).await;
        assert!(outcome.is_err());

        let record = h.store.get_deployment("d-1").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Deploying);
        assert!(!record.status.is_terminal());
        assert!(!phases(&h.store, "d-1").contains(&ProgressPhase::Failed));

        h.plane.ready_after.store(0, Ordering::SeqCst);
        let deployment = h.workflow.run("d-1").await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Ready);
        assert_eq!(h.plane.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn builds_source_before_deploying() {
        let mut h = harness(FakePlane::ready_after(0), None, fast());
        let builder = Arc::new(FakeBuilder {
            builds: AtomicU32::new(0),
            outcome: BuildStatus::Succeeded,
        });
        h.workflow = h.workflow.with_builder(builder.clone());
        queue(
            &h,
            "d-1",
            DeploySource::Build(BuildContext {
                context_url: "s3://ctx/d-1.tar.gz".into(),
                dockerfile: None,
            }),
        );

        let deployment = h.workflow.run("d-1").await.unwrap();
        assert_eq!(deployment.image.as_deref(), Some("registry.local/proj-1:b-1"));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(phases(&h.store, "d-1")[1], ProgressPhase::Building);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_build_never_creates_workload() {
        let mut h = harness(FakePlane::ready_after(0), None, fast());
        h.workflow = h.workflow.with_builder(Arc::new(FakeBuilder {
            builds: AtomicU32::new(0),
            outcome: BuildStatus::Failed {
                reason: "compile error".into(),
            },
        }));
        queue(
            &h,
            "d-1",
            DeploySource::Build(BuildContext {
                context_url: "s3://ctx/d-1.tar.gz".into(),
                dockerfile: None,
            }),
        );

        let err = h.workflow.run("d-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Build(_)));
        assert_eq!(h.plane.creates.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.store.get_deployment("d-1").unwrap().unwrap().status,
            DeploymentStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn build_without_builder_is_rejected() {
        let h = harness(FakePlane::ready_after(0), None, fast());
        queue(
            &h,
            "d-1",
            DeploySource::Build(BuildContext {
                context_url: "s3://ctx/d-1.tar.gz".into(),
                dockerfile: None,
            }),
        );
        let err = h.workflow.run("d-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Precondition(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn rolled_back_project_keeps_routing() {
        let h = harness(FakePlane::ready_after(0), None, fast());
        queue(&h, "d-1", image("registry.local/shop:1"));
        h.workflow.run("d-1").await.unwrap();

        let mut project = h.store.get_project("proj-1").unwrap().unwrap();
        project.is_rolled_back = true;
        h.store.put_project(&project).unwrap();

        let mut second = deployment("d-2", DeploymentStatus::Pending);
        second.git_commit_sha = Some("fedcba987".into());
        second.image = None;
        h.workflow
            .enqueue(&second, &image("registry.local/shop:2"))
            .unwrap();
        let deployed = h.workflow.run("d-2").await.unwrap();
        assert_eq!(deployed.status, DeploymentStatus::Ready);

        let project = h.store.get_project("proj-1").unwrap().unwrap();
        assert_eq!(project.live_deployment_id.as_deref(), Some("d-1"));
        assert_eq!(
            h.store
                .get_domain("shop-production-acme.keel.app")
                .unwrap()
                .unwrap()
                .deployment_id,
            "d-1"
        );
        // The new commit domain still points at the new deployment.
        assert_eq!(
            h.store
                .get_domain("shop-git-fedcba9-acme.keel.app")
                .unwrap()
                .unwrap()
                .deployment_id,
            "d-2"
        );
    }

    #[tokio::test]
    async fn run_without_recorded_request_is_not_found() {
        let h = harness(FakePlane::ready_after(0), None, fast());
        let err = h.workflow.run("d-missing").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn deployment_without_request_is_failed_not_left_pending() {
        let h = harness(FakePlane::ready_after(0), None, fast());
        h.store
            .insert_deployment(&deployment("d-1", DeploymentStatus::Pending))
            .unwrap();

        let err = h.workflow.run("d-1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound(_)));
        assert_eq!(
            h.store.get_deployment("d-1").unwrap().unwrap().status,
            DeploymentStatus::Failed
        );
        assert_eq!(phases(&h.store, "d-1"), vec![ProgressPhase::Failed]);
    }

    #[test]
    fn enqueue_writes_deployment_and_request_together() {
        let h = harness(FakePlane::ready_after(0), None, fast());
        let record = deployment("d-1", DeploymentStatus::Pending);
        h.workflow.enqueue(&record, &image("registry.local/shop:1")).unwrap();
        assert!(h.workflow.recorded_request("d-1").unwrap().is_some());

        // A duplicate id leaves the first request untouched.
        let err = h
            .workflow
            .enqueue(&record, &image("registry.local/shop:2"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::State(_)));
        assert_eq!(
            h.workflow.recorded_request("d-1").unwrap(),
            Some(image("registry.local/shop:1"))
        );
    }
}
