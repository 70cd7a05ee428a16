//! keel-agent — the edge agent that applies desired state locally.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine
//!   ├── watch / pull / reconcile / refresh loops → inbound EventBuffer
//!   ├── Router → {Deployment,Sentinel,Gateway}Controller
//!   │              └── Reconciler → Orchestrator (hash-diffed apply, idempotent delete)
//!   └── push loop ← Reporter (outbound EventBuffer)
//!         └── CircuitBreaker(RetryPolicy(ControlPlane::report))
//! ```

pub mod controller;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod reporter;
pub mod resilience;

pub use controller::{Controller, Router};
pub use engine::{EngineConfig, SyncEngine};
pub use error::{AgentError, AgentResult, OrchestratorError};
pub use orchestrator::{InMemoryOrchestrator, Orchestrator, WorkloadKey, WorkloadSpec};
pub use reconciler::{ApplyOutcome, Reconciler};
pub use reporter::Reporter;
pub use resilience::{Backoff, BreakerConfig, BreakerError, CircuitBreaker, RetryPolicy};
