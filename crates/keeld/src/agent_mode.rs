//! Agent mode — runs next to a cluster and keeps it in line with the
//! control plane.
//!
//! In this mode, the daemon:
//! 1. Builds a lazily connecting gRPC client for the control plane
//! 2. Starts the sync engine against the local orchestrator
//! 3. On Ctrl-C, stops every engine loop and exits

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use keel_agent::{InMemoryOrchestrator, SyncEngine};
use keel_sync::GrpcControlPlane;

use crate::config::AgentConfig;

/// Run the agent until Ctrl-C.
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!("Keel daemon starting in agent mode");

    let endpoint = config.endpoint();
    let plane = GrpcControlPlane::connect_lazy(&endpoint, config.client())?;
    info!(%endpoint, "control plane client ready");

    let identity = config.identity();
    let orchestrator = Arc::new(InMemoryOrchestrator::new());
    let engine = Arc::new(SyncEngine::new(
        Arc::new(plane),
        identity,
        orchestrator,
        config.engine(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_handle = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = engine_handle.await;

    info!("agent stopped");
    Ok(())
}
