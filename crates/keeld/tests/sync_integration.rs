//! Control plane ⇄ agent integration tests.
//!
//! Runs the sync gRPC service on an ephemeral port and an edge agent with
//! an in-memory orchestrator in the same process, then drives deployments
//! through the workflow and checks that the agent applies them and the
//! control plane sees the reported instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;

use keel_agent::{Backoff, EngineConfig, InMemoryOrchestrator, SyncEngine};
use keel_state::*;
use keel_sync::{AgentIdentity, ClientConfig, GrpcControlPlane, SyncServer, SyncService};
use keel_workflow::{
    CreateDeployment, DeploySource, DeployWorkflow, DeploymentService, DomainRouter,
    SchemaFetcher, SyncPlane, WorkflowConfig,
};

const REGION: &str = "us-east-1";

struct NoSchema;

#[async_trait]
impl SchemaFetcher for NoSchema {
    async fn fetch(&self, _address: &str) -> Option<String> {
        None
    }
}

struct Cluster {
    store: StateStore,
    routing: RoutingStore,
    sync: SyncService,
    orchestrator: Arc<InMemoryOrchestrator>,
    deployments: DeploymentService,
    shutdown: watch::Sender<bool>,
}

fn seed(store: &StateStore) {
    store
        .put_workspace(&Workspace {
            id: "ws-1".into(),
            slug: "acme".into(),
            created_at: 1000,
        })
        .unwrap();
    store
        .put_project(&Project {
            id: "proj-1".into(),
            workspace_id: "ws-1".into(),
            slug: "shop".into(),
            live_deployment_id: None,
            is_rolled_back: false,
            created_at: 1000,
            updated_at: 1000,
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

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn start_cluster() -> Cluster {
    let store = StateStore::open_in_memory().unwrap();
    let routing = RoutingStore::open_in_memory(REGION).unwrap();
    seed(&store);

    // Control plane gRPC on an ephemeral port.
    let sync = SyncService::new(store.clone(), Default::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = SyncServer::new(sync.clone()).into_service();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    // Agent.
    let plane =
        GrpcControlPlane::connect_lazy(&format!("http://{addr}"), ClientConfig::default()).unwrap();
    let orchestrator = Arc::new(InMemoryOrchestrator::new());
    let engine = Arc::new(SyncEngine::new(
        Arc::new(plane),
        AgentIdentity::new("agent-1", REGION, "a"),
        orchestrator.clone(),
        EngineConfig::default()
            .with_pull_interval(Duration::from_secs(1))
            .with_reconcile_interval(Duration::from_secs(1))
            .with_watch_backoff(Backoff::Linear {
                step: Duration::from_millis(100),
                max: Duration::from_millis(500),
            }),
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(engine.run(shutdown_rx));

    let registry = sync.registry().clone();
    eventually("agent registration", || registry.len() == 1).await;

    let workflow = DeployWorkflow::new(
        store.clone(),
        DomainRouter::new(store.clone(), routing.clone()),
        Arc::new(SyncPlane::new(sync.clone())),
        Arc::new(NoSchema),
        WorkflowConfig::default().with_instance_polls(Duration::from_millis(100), 150),
    );

    Cluster {
        deployments: DeploymentService::new(store.clone(), workflow),
        store,
        routing,
        sync,
        orchestrator,
        shutdown,
    }
}

fn request(image: &str, sha: &str) -> CreateDeployment {
    CreateDeployment {
        workspace_id: "ws-1".into(),
        project_id: "proj-1".into(),
        environment_id: "env-prod".into(),
        git_commit_sha: Some(sha.into()),
        git_branch: Some("main".into()),
        source: DeploySource::Image {
            image: image.into(),
        },
        region: REGION.into(),
        shard: None,
        resources: Resources {
            replicas: 2,
            cpu_millicores: 250,
            memory_mib: 256,
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deployment_becomes_ready_through_agent() {
    let cluster = start_cluster().await;

    let deployment = cluster
        .deployments
        .create_deployment(request("registry.local/shop:1", "aaaaaaa1111"))
        .await
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Ready);

    // The agent runs the workload and reported both replicas.
    assert_eq!(cluster.orchestrator.workloads().len(), 1);
    let instances = cluster
        .store
        .list_instances_for_deployment(&deployment.id)
        .unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.status == InstanceStatus::Running));

    // Routing points at the reported addresses.
    let config = cluster
        .routing
        .get_config("shop-production-acme.keel.app")
        .unwrap()
        .unwrap();
    assert_eq!(config.deployment_id, deployment.id);
    assert_eq!(config.instances.len(), 2);
    assert_eq!(config.auth.unwrap().keyspace_id, "ks-1");

    let project = cluster.store.get_project("proj-1").unwrap().unwrap();
    assert_eq!(project.live_deployment_id, Some(deployment.id));

    let _ = cluster.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_and_promote_across_agent_deploys() {
    let cluster = start_cluster().await;

    let first = cluster
        .deployments
        .create_deployment(request("registry.local/shop:1", "aaaaaaa1111"))
        .await
        .unwrap();
    let second = cluster
        .deployments
        .create_deployment(request("registry.local/shop:2", "bbbbbbb2222"))
        .await
        .unwrap();
    assert_eq!(cluster.orchestrator.workloads().len(), 2);

    let env_host = "shop-production-acme.keel.app";
    assert_eq!(
        cluster.store.get_domain(env_host).unwrap().unwrap().deployment_id,
        second.id
    );

    let project = cluster.deployments.rollback(&second.id, &first.id).await.unwrap();
    assert!(project.is_rolled_back);
    assert_eq!(
        cluster.store.get_domain(env_host).unwrap().unwrap().deployment_id,
        first.id
    );
    assert_eq!(
        cluster.routing.get_config(env_host).unwrap().unwrap().deployment_id,
        first.id
    );

    let project = cluster.deployments.promote(&second.id).await.unwrap();
    assert!(!project.is_rolled_back);
    assert_eq!(project.live_deployment_id.as_deref(), Some(second.id.as_str()));

    let _ = cluster.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn archived_deployment_is_removed_by_agent() {
    let cluster = start_cluster().await;

    let deployment = cluster
        .deployments
        .create_deployment(request("registry.local/shop:1", "ccccccc3333"))
        .await
        .unwrap();
    assert_eq!(cluster.orchestrator.workloads().len(), 1);

    let archived = cluster
        .store
        .update_deployment(&deployment.id, |d| d.desired_state = DesiredState::Archived)
        .unwrap();
    cluster.sync.notify_deployment(&archived).unwrap();

    let orchestrator = cluster.orchestrator.clone();
    eventually("workload removal", || orchestrator.workloads().is_empty()).await;

    let store = cluster.store.clone();
    let id = deployment.id.clone();
    eventually("instance cleanup", || {
        store.list_instances_for_deployment(&id).unwrap().is_empty()
    })
    .await;

    let _ = cluster.shutdown.send(true);
}
