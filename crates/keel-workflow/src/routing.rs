//! Domain assignment, promote and rollback.
//!
//! All routing changes go through [`DomainRouter::switch_routing`], which
//! writes gateway configs for the target deployment first and only then
//! moves domain rows, so no hostname ever resolves to a deployment the
//! gateways have no config for.
//!
//! Changes for one project are serialized through [`KeyedLocks`] keyed by
//! project id. Different projects never contend.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use keel_state::{
    AuthConfig, Deployment, DeploymentStatus, Domain, Environment, GatewayConfig, Instance,
    InstanceStatus, Project, RoutingStore, StateError, StateStore, Sticky, ValidationConfig,
    epoch_secs,
};

use crate::domains::{DomainSpec, is_local_hostname};
use crate::durable::KeyedLocks;
use crate::error::{WorkflowError, WorkflowResult};

/// One planned change to a domain row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainChange {
    /// Create a new row.
    Insert(Domain),
    /// Point an existing row at the target, expecting it to still point at `from`.
    Reassign { hostname: String, from: String },
}

impl DomainChange {
    pub fn hostname(&self) -> &str {
        match self {
            DomainChange::Insert(domain) => &domain.hostname,
            DomainChange::Reassign { hostname, .. } => hostname,
        }
    }
}

/// Gateway configs for every non-local hostname, routing to `target`'s
/// running instances.
pub fn gateway_configs<'a>(
    target: &Deployment,
    instances: &[Instance],
    environment: &Environment,
    hostnames: impl IntoIterator<Item = &'a str>,
) -> Vec<GatewayConfig> {
    let addresses: Vec<String> = instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Running)
        .map(|i| i.address.clone())
        .collect();
    let now = epoch_secs();

    hostnames
        .into_iter()
        .filter(|h| !is_local_hostname(h))
        .map(|hostname| GatewayConfig {
            hostname: hostname.to_string(),
            workspace_id: target.workspace_id.clone(),
            project_id: target.project_id.clone(),
            environment_id: target.environment_id.clone(),
            deployment_id: target.id.clone(),
            instances: addresses.clone(),
            auth: environment
                .auth_keyspace_id
                .clone()
                .map(|keyspace_id| AuthConfig { keyspace_id }),
            validation: target
                .openapi_spec
                .clone()
                .map(|openapi_spec| ValidationConfig { openapi_spec }),
            updated_at: now,
        })
        .collect()
}

/// Owns routing mutations for the control plane.
#[derive(Clone)]
pub struct DomainRouter {
    store: StateStore,
    routing: RoutingStore,
    locks: KeyedLocks,
}

impl DomainRouter {
    pub fn new(store: StateStore, routing: RoutingStore) -> Self {
        Self {
            store,
            routing,
            locks: KeyedLocks::new(),
        }
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub fn routing(&self) -> &RoutingStore {
        &self.routing
    }

    // ── Deploy-time assignment ─────────────────────────────────────

    /// Decide what happens to each hostname `deployment` should own.
    ///
    /// New hostnames are inserted. Existing rows are reassigned unless they
    /// are commit domains, already point here, or the project is rolled
    /// back. Live domains of the environment follow the deploy under the
    /// same rule. Rows owned by another workspace or project fail the plan.
    pub fn plan(
        &self,
        deployment: &Deployment,
        specs: &[DomainSpec],
        rolled_back: bool,
    ) -> WorkflowResult<Vec<DomainChange>> {
        let now = epoch_secs();
        let mut changes = Vec::new();

        for spec in specs {
            match self.store.get_domain(&spec.hostname)? {
                None => changes.push(DomainChange::Insert(Domain {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: deployment.workspace_id.clone(),
                    project_id: deployment.project_id.clone(),
                    environment_id: deployment.environment_id.clone(),
                    hostname: spec.hostname.clone(),
                    deployment_id: deployment.id.clone(),
                    sticky: spec.sticky,
                    created_at: now,
                    updated_at: now,
                })),
                Some(existing) => {
                    check_owner(&existing, deployment)?;
                    if existing.deployment_id == deployment.id {
                        changes.push(DomainChange::Reassign {
                            hostname: existing.hostname,
                            from: existing.deployment_id,
                        });
                    } else if existing.sticky == Sticky::None || rolled_back {
                        debug!(hostname = %existing.hostname, "domain left in place");
                    } else {
                        changes.push(DomainChange::Reassign {
                            hostname: existing.hostname,
                            from: existing.deployment_id,
                        });
                    }
                }
            }
        }

        if !rolled_back {
            let live = self.store.list_domains_for_environment(
                &deployment.project_id,
                &deployment.environment_id,
                &[Sticky::Live],
            )?;
            for domain in live {
                if changes.iter().any(|c| c.hostname() == domain.hostname) {
                    continue;
                }
                check_owner(&domain, deployment)?;
                changes.push(DomainChange::Reassign {
                    hostname: domain.hostname,
                    from: domain.deployment_id,
                });
            }
        }

        Ok(changes)
    }

    // ── Switch ─────────────────────────────────────────────────────

    /// Apply `changes` in one transaction, upserting `configs` once every
    /// domain row has been checked and before any row is written.
    ///
    /// A reassigned row that no longer points at the expected deployment,
    /// or an insert whose hostname appeared meanwhile, aborts with a
    /// conflict before any config or domain is written.
    pub fn switch_routing(
        &self,
        target: &Deployment,
        changes: &[DomainChange],
        configs: &[GatewayConfig],
    ) -> WorkflowResult<()> {
        let now = epoch_secs();
        let result = self.store.atomically(|txn| {
            let mut rows = Vec::with_capacity(changes.len());
            for change in changes {
                match change {
                    DomainChange::Insert(domain) => match txn.get::<Domain>(&domain.hostname)? {
                        None => rows.push(domain.clone()),
                        Some(existing) if existing.deployment_id == domain.deployment_id => {}
                        Some(_) => {
                            return Err(StateError::Conflict(format!(
                                "domain {} was created concurrently",
                                domain.hostname
                            )));
                        }
                    },
                    DomainChange::Reassign { hostname, from } => {
                        let mut row: Domain = txn
                            .get(hostname)?
                            .ok_or_else(|| StateError::NotFound(format!("domain {hostname}")))?;
                        if row.deployment_id == target.id {
                            continue;
                        }
                        if row.deployment_id != *from || row.workspace_id != target.workspace_id {
                            return Err(StateError::Conflict(format!(
                                "domain {hostname} changed concurrently"
                            )));
                        }
                        row.deployment_id = target.id.clone();
                        row.updated_at = now;
                        rows.push(row);
                    }
                }
            }

            // Every row checked out: publish configs, then repoint domains.
            self.routing.upsert_configs(configs)?;
            for row in &rows {
                txn.put(row)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                info!(
                    deployment_id = %target.id,
                    domains = changes.len(),
                    configs = configs.len(),
                    "routing switched"
                );
                Ok(())
            }
            Err(StateError::Conflict(msg)) => Err(WorkflowError::Conflict(msg)),
            Err(e) => Err(e.into()),
        }
    }

    // ── Promote / rollback ─────────────────────────────────────────

    /// Make `target_id` the live deployment of its project and clear the
    /// rolled-back flag.
    pub async fn promote(&self, target_id: &str) -> WorkflowResult<Project> {
        let target = self.deployment(target_id)?;
        let _guard = self.locks.lock(&target.project_id).await;

        let target = self.deployment(target_id)?;
        let instances = self.routable(&target)?;
        let mut project = self.project(&target.project_id)?;
        if project.live_deployment_id.as_deref() == Some(target_id) {
            return Err(WorkflowError::Precondition(
                "already the live deployment".into(),
            ));
        }

        self.move_environment(&target, &instances)?;

        project.live_deployment_id = Some(target.id.clone());
        project.is_rolled_back = false;
        project.updated_at = epoch_secs();
        self.store.put_project(&project)?;
        info!(deployment_id = %target.id, project_id = %project.id, "deployment promoted");
        Ok(project)
    }

    /// Point the project back from the live `source_id` to `target_id` and
    /// set the rolled-back flag so later deploys leave routing alone.
    pub async fn rollback(&self, source_id: &str, target_id: &str) -> WorkflowResult<Project> {
        let source = self.deployment(source_id)?;
        let _guard = self.locks.lock(&source.project_id).await;

        let source = self.deployment(source_id)?;
        let target = self.deployment(target_id)?;
        if source.id == target.id {
            return Err(WorkflowError::Precondition(
                "source and target are the same deployment".into(),
            ));
        }
        if source.project_id != target.project_id
            || source.environment_id != target.environment_id
        {
            return Err(WorkflowError::Precondition(
                "source and target belong to different projects or environments".into(),
            ));
        }
        let instances = self.routable(&target)?;
        let mut project = self.project(&target.project_id)?;
        if project.live_deployment_id.as_deref() != Some(source_id) {
            return Err(WorkflowError::Precondition(
                "source is not the live deployment".into(),
            ));
        }

        self.move_environment(&target, &instances)?;

        project.live_deployment_id = Some(target.id.clone());
        project.is_rolled_back = true;
        project.updated_at = epoch_secs();
        self.store.put_project(&project)?;
        info!(
            from = %source.id,
            to = %target.id,
            project_id = %project.id,
            "deployment rolled back"
        );
        Ok(project)
    }

    /// Move every environment and live domain of `target`'s environment.
    fn move_environment(&self, target: &Deployment, instances: &[Instance]) -> WorkflowResult<()> {
        let environment = self.environment(&target.environment_id)?;
        let domains = self.store.list_domains_for_environment(
            &target.project_id,
            &target.environment_id,
            &[Sticky::Environment, Sticky::Live],
        )?;

        let changes: Vec<DomainChange> = domains
            .into_iter()
            .map(|d| DomainChange::Reassign {
                hostname: d.hostname,
                from: d.deployment_id,
            })
            .collect();
        let configs = gateway_configs(
            target,
            instances,
            &environment,
            changes.iter().map(DomainChange::hostname),
        );
        self.switch_routing(target, &changes, &configs)
    }

    /// Running instances of a ready deployment, or the reason it cannot
    /// receive traffic.
    fn routable(&self, target: &Deployment) -> WorkflowResult<Vec<Instance>> {
        if target.status != DeploymentStatus::Ready {
            return Err(WorkflowError::Precondition("deployment not ready".into()));
        }
        let running: Vec<Instance> = self
            .store
            .list_instances_for_deployment(&target.id)?
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .collect();
        if running.is_empty() {
            return Err(WorkflowError::Precondition("no running VMs".into()));
        }
        Ok(running)
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

fn check_owner(domain: &Domain, deployment: &Deployment) -> WorkflowResult<()> {
    if domain.workspace_id != deployment.workspace_id {
        return Err(WorkflowError::Conflict(format!(
            "domain {} belongs to another workspace",
            domain.hostname
        )));
    }
    if domain.project_id != deployment.project_id {
        return Err(WorkflowError::Conflict(format!(
            "domain {} belongs to another project",
            domain.hostname
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use keel_state::{DesiredState, Resources, Workspace};

    use super::*;

    pub(crate) fn seed_tenancy(store: &StateStore) {
        store
            .put_workspace(&Workspace {
                id: "ws-1".into(),
                slug: "acme".into(),
                created_at: 0,
            })
            .unwrap();
        store
            .put_project(&Project {
                id: "proj-1".into(),
                workspace_id: "ws-1".into(),
                slug: "shop".into(),
                live_deployment_id: None,
                is_rolled_back: false,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        store
            .put_environment(&Environment {
                id: "env-prod".into(),
                workspace_id: "ws-1".into(),
                project_id: "proj-1".into(),
                slug: "production".into(),
                auth_keyspace_id: Some("ks-1".into()),
            })
            .unwrap();
    }

    pub(crate) fn deployment(id: &str, status: DeploymentStatus) -> Deployment {
        Deployment {
            id: id.into(),
            workspace_id: "ws-1".into(),
            project_id: "proj-1".into(),
            environment_id: "env-prod".into(),
            git_commit_sha: Some("abc1234def".into()),
            git_branch: Some("main".into()),
            image: Some("registry.local/shop:1".into()),
            region: "us-east-1".into(),
            shard: None,
            resources: Resources {
                replicas: 1,
                cpu_millicores: 250,
                memory_mib: 256,
            },
            desired_state: DesiredState::Running,
            status,
            openapi_spec: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub(crate) fn instance(deployment_id: &str, id: &str, status: InstanceStatus) -> Instance {
        Instance {
            id: id.into(),
            deployment_id: deployment_id.into(),
            region: "us-east-1".into(),
            address: format!("{id}.ws-1.svc:8080"),
            cpu_millicores: 250,
            memory_mib: 256,
            status,
            updated_at: 0,
        }
    }

    fn domain(hostname: &str, deployment_id: &str, sticky: Sticky) -> Domain {
        Domain {
            id: format!("dom-{hostname}"),
            workspace_id: "ws-1".into(),
            project_id: "proj-1".into(),
            environment_id: "env-prod".into(),
            hostname: hostname.into(),
            deployment_id: deployment_id.into(),
            sticky,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn router() -> (DomainRouter, StateStore, RoutingStore) {
        let store = StateStore::open_in_memory().unwrap();
        let routing = RoutingStore::open_in_memory("us-east-1").unwrap();
        seed_tenancy(&store);
        (
            DomainRouter::new(store.clone(), routing.clone()),
            store,
            routing,
        )
    }

    fn set_live(store: &StateStore, deployment_id: &str) {
        let mut project = store.get_project("proj-1").unwrap().unwrap();
        project.live_deployment_id = Some(deployment_id.into());
        store.put_project(&project).unwrap();
    }

    /// Two ready deployments, `d-old` live on the environment domain.
    fn two_ready(store: &StateStore) {
        for id in ["d-old", "d-new"] {
            store
                .insert_deployment(&deployment(id, DeploymentStatus::Ready))
                .unwrap();
            store
                .upsert_instance(&instance(id, &format!("{id}-0"), InstanceStatus::Running))
                .unwrap();
        }
        store
            .insert_domain(&domain(
                "shop-production-acme.keel.app",
                "d-old",
                Sticky::Environment,
            ))
            .unwrap();
        store
            .insert_domain(&domain("shop.example.com", "d-old", Sticky::Live))
            .unwrap();
        set_live(store, "d-old");
    }

    #[test]
    fn gateway_configs_skip_local_hosts_and_carry_auth() {
        let mut target = deployment("d-1", DeploymentStatus::Ready);
        target.openapi_spec = Some("openapi: 3.0.0".into());
        let env = Environment {
            id: "env-prod".into(),
            workspace_id: "ws-1".into(),
            project_id: "proj-1".into(),
            slug: "production".into(),
            auth_keyspace_id: Some("ks-1".into()),
        };
        let instances = vec![
            instance("d-1", "d-1-0", InstanceStatus::Running),
            instance("d-1", "d-1-1", InstanceStatus::Provisioning),
        ];
        let configs = gateway_configs(
            &target,
            &instances,
            &env,
            ["shop.keel.app", "shop.localhost"],
        );
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].instances, vec!["d-1-0.ws-1.svc:8080"]);
        assert_eq!(configs[0].auth.as_ref().unwrap().keyspace_id, "ks-1");
        assert_eq!(
            configs[0].validation.as_ref().unwrap().openapi_spec,
            "openapi: 3.0.0"
        );
    }

    #[test]
    fn plan_inserts_new_and_reassigns_sticky() {
        let (router, store, _) = router();
        store
            .insert_domain(&domain("shop-git-main-acme.keel.app", "d-0", Sticky::Branch))
            .unwrap();
        store
            .insert_domain(&domain("shop-git-abc1234-acme.keel.app", "d-0", Sticky::None))
            .unwrap();
        store
            .insert_domain(&domain("shop.example.com", "d-0", Sticky::Live))
            .unwrap();

        let target = deployment("d-1", DeploymentStatus::Deploying);
        let specs = vec![
            DomainSpec {
                hostname: "shop-git-abc1234-acme.keel.app".into(),
                sticky: Sticky::None,
            },
            DomainSpec {
                hostname: "shop-git-main-acme.keel.app".into(),
                sticky: Sticky::Branch,
            },
            DomainSpec {
                hostname: "shop-production-acme.keel.app".into(),
                sticky: Sticky::Environment,
            },
        ];
        let changes = router.plan(&target, &specs, false).unwrap();
        let hosts: Vec<&str> = changes.iter().map(DomainChange::hostname).collect();
        assert_eq!(
            hosts,
            vec![
                "shop-git-main-acme.keel.app",
                "shop-production-acme.keel.app",
                "shop.example.com",
            ]
        );
        assert!(matches!(changes[1], DomainChange::Insert(_)));
    }

    #[test]
    fn plan_while_rolled_back_only_inserts() {
        let (router, store, _) = router();
        store
            .insert_domain(&domain("shop-git-main-acme.keel.app", "d-0", Sticky::Branch))
            .unwrap();
        let target = deployment("d-1", DeploymentStatus::Deploying);
        let specs = vec![
            DomainSpec {
                hostname: "shop-git-main-acme.keel.app".into(),
                sticky: Sticky::Branch,
            },
            DomainSpec {
                hostname: "shop-git-abc1234-acme.keel.app".into(),
                sticky: Sticky::None,
            },
        ];
        let changes = router.plan(&target, &specs, true).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], DomainChange::Insert(d) if d.sticky == Sticky::None));
    }

    #[test]
    fn plan_rejects_domain_of_another_workspace() {
        let (router, store, _) = router();
        let mut foreign = domain("shop-production-acme.keel.app", "d-x", Sticky::Environment);
        foreign.workspace_id = "ws-2".into();
        store.insert_domain(&foreign).unwrap();

        let target = deployment("d-1", DeploymentStatus::Deploying);
        let specs = vec![DomainSpec {
            hostname: "shop-production-acme.keel.app".into(),
            sticky: Sticky::Environment,
        }];
        let err = router.plan(&target, &specs, false).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        assert_eq!(
            store
                .get_domain("shop-production-acme.keel.app")
                .unwrap()
                .unwrap()
                .workspace_id,
            "ws-2"
        );
    }

    #[test]
    fn switch_aborts_on_concurrent_change() {
        let (router, store, routing) = router();
        store
            .insert_domain(&domain("a.keel.app", "d-0", Sticky::Environment))
            .unwrap();
        store
            .insert_domain(&domain("b.keel.app", "d-other", Sticky::Live))
            .unwrap();
        let target = deployment("d-1", DeploymentStatus::Ready);
        let changes = vec![
            DomainChange::Reassign {
                hostname: "a.keel.app".into(),
                from: "d-0".into(),
            },
            DomainChange::Reassign {
                hostname: "b.keel.app".into(),
                from: "d-0".into(),
            },
        ];
        let err = router.switch_routing(&target, &changes, &[]).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        // The first reassignment was rolled back with the transaction.
        assert_eq!(
            store.get_domain("a.keel.app").unwrap().unwrap().deployment_id,
            "d-0"
        );
        assert!(routing.get_config("a.keel.app").unwrap().is_none());
    }

    #[test]
    fn conflicting_switch_publishes_no_gateway_config() {
        let (router, store, routing) = router();
        store
            .insert_domain(&domain("a.keel.app", "d-0", Sticky::Environment))
            .unwrap();
        store
            .insert_domain(&domain("b.keel.app", "d-other", Sticky::Live))
            .unwrap();
        let target = deployment("d-1", DeploymentStatus::Ready);
        let environment = store.get_environment("env-prod").unwrap().unwrap();
        let instances = vec![instance("d-1", "d-1-0", InstanceStatus::Running)];
        let changes = vec![
            DomainChange::Reassign {
                hostname: "a.keel.app".into(),
                from: "d-0".into(),
            },
            DomainChange::Reassign {
                hostname: "b.keel.app".into(),
                from: "d-0".into(),
            },
        ];
        let configs = gateway_configs(
            &target,
            &instances,
            &environment,
            changes.iter().map(DomainChange::hostname),
        );
        assert_eq!(configs.len(), 2);

        let err = router.switch_routing(&target, &changes, &configs).unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
        for host in ["a.keel.app", "b.keel.app"] {
            assert!(routing.get_config(host).unwrap().is_none());
        }

        // Once the rows agree, configs and domains move together.
        let changes = &changes[..1];
        router
            .switch_routing(&target, changes, &configs[..1])
            .unwrap();
        assert_eq!(
            routing.get_config("a.keel.app").unwrap().unwrap().deployment_id,
            "d-1"
        );
        assert_eq!(
            store.get_domain("a.keel.app").unwrap().unwrap().deployment_id,
            "d-1"
        );
    }

    #[tokio::test]
    async fn promote_moves_environment_and_live_domains() {
        let (router, store, routing) = router();
        two_ready(&store);
        let mut project = store.get_project("proj-1").unwrap().unwrap();
        project.is_rolled_back = true;
        store.put_project(&project).unwrap();

        let project = router.promote("d-new").await.unwrap();
        assert_eq!(project.live_deployment_id.as_deref(), Some("d-new"));
        assert!(!project.is_rolled_back);

        for host in ["shop-production-acme.keel.app", "shop.example.com"] {
            assert_eq!(store.get_domain(host).unwrap().unwrap().deployment_id, "d-new");
            let config = routing.get_config(host).unwrap().unwrap();
            assert_eq!(config.deployment_id, "d-new");
            assert_eq!(config.instances, vec!["d-new-0.ws-1.svc:8080"]);
        }
    }

    #[tokio::test]
    async fn promote_rejects_live_target() {
        let (router, store, _) = router();
        two_ready(&store);
        let err = router.promote("d-old").await.unwrap_err();
        assert_eq!(err.to_string(), "already the live deployment");
    }

    #[tokio::test]
    async fn promote_rejects_unready_target() {
        let (router, store, _) = router();
        two_ready(&store);
        store
            .update_deployment_status("d-new", DeploymentStatus::Deploying)
            .unwrap();
        let err = router.promote("d-new").await.unwrap_err();
        assert_eq!(err.to_string(), "deployment not ready");
    }

    #[tokio::test]
    async fn rollback_sets_flag_and_moves_domains() {
        let (router, store, routing) = router();
        two_ready(&store);
        set_live(&store, "d-new");

        let project = router.rollback("d-new", "d-old").await.unwrap();
        assert_eq!(project.live_deployment_id.as_deref(), Some("d-old"));
        assert!(project.is_rolled_back);
        assert_eq!(
            routing
                .get_config("shop.example.com")
                .unwrap()
                .unwrap()
                .deployment_id,
            "d-old"
        );
    }

    #[tokio::test]
    async fn rollback_without_running_instances_mutates_nothing() {
        let (router, store, routing) = router();
        two_ready(&store);
        set_live(&store, "d-new");
        store
            .upsert_instance(&instance("d-old", "d-old-0", InstanceStatus::Stopping))
            .unwrap();
        let before = store.get_project("proj-1").unwrap().unwrap();

        let err = router.rollback("d-new", "d-old").await.unwrap_err();
        assert_eq!(err.to_string(), "no running VMs");

        assert_eq!(store.get_project("proj-1").unwrap().unwrap(), before);
        assert_eq!(
            store
                .get_domain("shop.example.com")
                .unwrap()
                .unwrap()
                .deployment_id,
            "d-old"
        );
        assert!(routing.get_config("shop.example.com").unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_requires_source_to_be_live() {
        let (router, store, _) = router();
        two_ready(&store);
        let err = router.rollback("d-new", "d-old").await.unwrap_err();
        assert_eq!(err.to_string(), "source is not the live deployment");
    }

    #[tokio::test]
    async fn rollback_rejects_mismatched_environment() {
        let (router, store, _) = router();
        two_ready(&store);
        set_live(&store, "d-new");
        let mut other = deployment("d-staging", DeploymentStatus::Ready);
        other.environment_id = "env-staging".into();
        store.insert_deployment(&other).unwrap();

        let err = router.rollback("d-new", "d-staging").await.unwrap_err();
        assert!(matches!(err, WorkflowError::Precondition(_)));
    }
}
