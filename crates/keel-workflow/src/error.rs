//! Workflow error types.

use thiserror::Error;

use keel_state::StateError;
use keel_sync::{SyncError, Transient};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The request cannot proceed in the current state. Never retried.
    #[error("{0}")]
    Precondition(String),

    /// Routing state owned by someone else.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

impl WorkflowError {
    /// True for errors returned to the caller without touching any state.
    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }
}

impl Transient for WorkflowError {
    fn is_transient(&self) -> bool {
        match self {
            WorkflowError::State(e) => e.is_transient(),
            WorkflowError::Sync(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_message_is_user_facing() {
        let err = WorkflowError::Precondition("deployment not ready".into());
        assert_eq!(err.to_string(), "deployment not ready");
        assert!(err.is_terminal());
    }

    #[test]
    fn state_conflict_is_not_retried() {
        let err: WorkflowError = StateError::Conflict("domain".into()).into();
        assert!(!err.is_transient());
    }
}
