//! Agent error types.

use thiserror::Error;

use keel_sync::{SyncError, Transient};

/// Errors returned by an [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("invalid resource: {0}")]
    Invalid(String),
}

impl Transient for OrchestratorError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Conflict(_) | OrchestratorError::Unavailable(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("unexpected event for {expected} controller: {got}")]
    WrongKind { expected: String, got: String },
}

pub type AgentResult<T> = Result<T, AgentError>;

impl Transient for AgentError {
    fn is_transient(&self) -> bool {
        match self {
            AgentError::Orchestrator(e) => e.is_transient(),
            AgentError::Sync(e) => e.is_transient(),
            AgentError::Validation(_) | AgentError::Serialize(_) | AgentError::WrongKind { .. } => {
                false
            }
        }
    }
}
