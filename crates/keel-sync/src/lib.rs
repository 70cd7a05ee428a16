//! keel-sync — control-plane synchronization for Keel agents.
//!
//! Fans desired-state events out to connected agents, answers full-state
//! and per-resource pulls, and records the observed state agents push
//! back.
//!
//! # Architecture
//!
//! ```text
//! Control Plane
//!   ├── SyncServer (gRPC, keel.sync.AgentSync)
//!   │   ├── Watch() → per-agent buffered event stream
//!   │   ├── GetDesiredState() → paged full pull
//!   │   ├── GetDesired{Deployment,Sentinel,Gateway}State() → Apply | Delete
//!   │   └── Update{Instance,Sentinel,Gateway}State(), UpdateDeploymentStatus()
//!   └── SyncService
//!       ├── AgentRegistry (client id → selectors + EventBuffer)
//!       └── StateStore (desired + observed records)
//!
//! Agent
//!   └── GrpcControlPlane (implements ControlPlane)
//! ```

pub mod buffer;
pub mod client;
pub mod control_plane;
pub mod desired;
pub mod error;
pub mod event;
pub mod proto;
pub mod registry;
pub mod selector;
pub mod server;
pub mod service;

pub use buffer::{BufferConfig, DropPolicy, EventBuffer};
pub use client::{ClientConfig, GrpcControlPlane};
pub use control_plane::{AgentIdentity, ControlPlane, EventStream};
pub use error::{SyncError, SyncResult, Transient};
pub use event::{
    Change, DeploymentIntent, DeploymentStatusReport, GatewayIntent, InfraEvent, InstanceChange,
    Labels, ResourceKind, Selectors, SentinelIntent, StatusUpdate, WorkloadRef, WorkloadReport,
};
pub use registry::AgentRegistry;
pub use server::SyncServer;
pub use service::SyncService;
