//! keel-workflow — deployment workflow and routing assignment.
//!
//! # Architecture
//!
//! ```text
//! DeploymentService
//!   ├── create / submit / resume ──► DeployWorkflow
//!   │                                 ├── Execution (StepJournal on StateStore)
//!   │                                 ├── Builder, SchemaFetcher, DeploymentPlane
//!   │                                 └── DomainRouter (per-project KeyedLocks)
//!   └── promote / rollback ─────────► DomainRouter::switch_routing
//!                                       gateway configs first, then domain rows
//! ```

pub mod builder;
pub mod deploy;
pub mod domains;
pub mod durable;
pub mod error;
pub mod plane;
pub mod routing;
pub mod schema;
pub mod service;

pub use builder::{BuildContext, BuildStatus, BuildTicket, Builder};
pub use deploy::{DeploySource, DeployWorkflow, WorkflowConfig};
pub use domains::{DomainSpec, domain_set, is_local_hostname, slug};
pub use durable::{Execution, KeyedLocks, StepJournal};
pub use error::{WorkflowError, WorkflowResult};
pub use plane::{DeploymentPlane, SyncPlane};
pub use routing::{DomainChange, DomainRouter};
pub use schema::{HttpSchemaFetcher, SchemaFetcher};
pub use service::{CreateDeployment, DeploymentService};
