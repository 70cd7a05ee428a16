//! Control plane mode — serves the agent sync gRPC service and the
//! deployment REST API.
//!
//! In this mode, the daemon:
//! 1. Opens the state store and the routing store
//! 2. Serves `AgentSync` over gRPC for edge agents
//! 3. Serves the REST API over HTTP (separate port)
//! 4. Resumes deployments left unfinished by a previous run
//! 5. Periodically evicts idle agent registrations

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use keel_state::{RoutingStore, StateStore};
use keel_sync::{SyncServer, SyncService};
use keel_workflow::{
    DeployWorkflow, DeploymentService, DomainRouter, HttpSchemaFetcher, SyncPlane,
};

use crate::api::{ApiState, build_router};
use crate::config::ControlPlaneConfig;

/// Run the control plane until Ctrl-C.
pub async fn run_control_plane(config: ControlPlaneConfig) -> anyhow::Result<()> {
    info!("Keel daemon starting in control-plane mode");
    std::fs::create_dir_all(&config.data_dir)?;

    // ── Stores ───────────────────────────────────────────────────
    let state_path = config.data_dir.join("keel.redb");
    let store = StateStore::open(&state_path)?;
    info!(path = ?state_path, "state store opened");

    let routing_path = config.data_dir.join("routing.redb");
    let routing = RoutingStore::open(&routing_path, &config.routing_partition)?;
    info!(path = ?routing_path, partition = %config.routing_partition, "routing store opened");

    // ── Services ─────────────────────────────────────────────────
    let sync = SyncService::new(store.clone(), config.buffer);
    let workflow = DeployWorkflow::new(
        store.clone(),
        DomainRouter::new(store.clone(), routing),
        Arc::new(SyncPlane::new(sync.clone())),
        Arc::new(HttpSchemaFetcher::new().with_timeout(config.schema_timeout())),
        config.workflow(),
    );
    let deployments = DeploymentService::new(store, workflow);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── gRPC server ──────────────────────────────────────────────
    let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.grpc_port));
    let grpc_service = SyncServer::new(sync.clone()).into_service();
    let mut grpc_shutdown = shutdown_rx.clone();
    info!(%grpc_addr, "gRPC server starting (agent sync)");
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(grpc_service)
            .serve_with_shutdown(grpc_addr, async move {
                let _ = grpc_shutdown.changed().await;
            })
            .await
        {
            error!(error = %e, "gRPC server error");
        }
    });

    // ── Registry eviction ────────────────────────────────────────
    let registry = sync.registry().clone();
    let ttl = config.registry_idle_ttl();
    let mut interval = tokio::time::interval(config.eviction_interval());
    let mut eviction_shutdown = shutdown_rx.clone();
    let eviction_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = registry.evict_idle(ttl);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "evicted idle agents");
                    }
                }
                _ = eviction_shutdown.changed() => break,
            }
        }
    });

    // ── Resume unfinished deployments ────────────────────────────
    let resumer = deployments.clone();
    tokio::spawn(async move {
        match resumer.resume_incomplete().await {
            Ok(0) => {}
            Ok(ready) => info!(ready, "resumed deployments"),
            Err(e) => warn!(error = %e, "could not resume deployments"),
        }
    });

    // ── REST API server ──────────────────────────────────────────
    let router = build_router(ApiState { deployments });
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!(%api_addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(api_addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = grpc_handle.await;
    let _ = eviction_handle.await;

    info!("control plane stopped");
    Ok(())
}
