//! keeld — the Keel daemon.
//!
//! One binary, two roles:
//! - `control-plane`: state store, agent sync gRPC service, deployment
//!   workflows and the REST API
//! - `agent`: edge agent syncing a local orchestrator with the control plane
//!
//! # Usage
//!
//! ```text
//! keeld control-plane --config /etc/keel/control-plane.toml
//! keeld agent --control-plane cp.internal:50051 --region us-east-1 --shard a
//! ```

mod agent_mode;
mod api;
mod config;
mod control_plane;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::config::{AgentConfig, ControlPlaneConfig};

#[derive(Parser)]
#[command(name = "keeld", about = "Keel daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (sync service, workflows, REST API).
    ControlPlane {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// gRPC port agents connect to.
        #[arg(long)]
        grpc_port: Option<u16>,

        /// REST API port.
        #[arg(long)]
        api_port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Run an edge agent.
    Agent {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Control plane gRPC address (host:port or URL).
        #[arg(long)]
        control_plane: Option<String>,

        /// Stable client id for this agent.
        #[arg(long)]
        client_id: Option<String>,

        #[arg(long)]
        region: Option<String>,

        #[arg(long)]
        shard: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keeld=debug,keel=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::ControlPlane {
            config,
            grpc_port,
            api_port,
            data_dir,
        } => {
            let mut cfg: ControlPlaneConfig = config::load(config.as_deref())?;
            if let Some(port) = grpc_port {
                cfg.grpc_port = port;
            }
            if let Some(port) = api_port {
                cfg.api_port = port;
            }
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            control_plane::run_control_plane(cfg).await
        }
        Command::Agent {
            config,
            control_plane,
            client_id,
            region,
            shard,
        } => {
            let mut cfg: AgentConfig = config::load(config.as_deref())?;
            if let Some(addr) = control_plane {
                cfg.control_plane = addr;
            }
            if let Some(id) = client_id {
                cfg.client_id = id;
            }
            if let Some(region) = region {
                cfg.region = region;
            }
            if let Some(shard) = shard {
                cfg.shard = shard;
            }
            agent_mode::run_agent(cfg).await
        }
    }
}
