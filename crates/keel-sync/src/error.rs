//! Sync service error types.

use thiserror::Error;
use tonic::{Code, Status};

use keel_state::StateError;

/// Errors surfaced by the sync service and its transports.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Classifies errors as worth retrying or not.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for SyncError {
    fn is_transient(&self) -> bool {
        match self {
            SyncError::Unavailable(_)
            | SyncError::DeadlineExceeded(_)
            | SyncError::Transport(_)
            | SyncError::Internal(_) => true,
            SyncError::State(e) => e.is_transient(),
            SyncError::NotFound(_)
            | SyncError::InvalidArgument(_)
            | SyncError::FailedPrecondition(_)
            | SyncError::Codec(_) => false,
        }
    }
}

impl From<SyncError> for Status {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::NotFound(_) => Status::not_found(message),
            SyncError::InvalidArgument(_) | SyncError::Codec(_) => {
                Status::invalid_argument(message)
            }
            SyncError::FailedPrecondition(_) => Status::failed_precondition(message),
            SyncError::Unavailable(_) | SyncError::Transport(_) => Status::unavailable(message),
            SyncError::DeadlineExceeded(_) => Status::deadline_exceeded(message),
            SyncError::Internal(_) => Status::internal(message),
            SyncError::State(StateError::NotFound(_)) => Status::not_found(message),
            SyncError::State(_) => Status::internal(message),
        }
    }
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => SyncError::NotFound(message),
            Code::InvalidArgument => SyncError::InvalidArgument(message),
            Code::FailedPrecondition => SyncError::FailedPrecondition(message),
            Code::Unavailable => SyncError::Unavailable(message),
            Code::DeadlineExceeded => SyncError::DeadlineExceeded(message),
            _ => SyncError::Internal(message),
        }
    }
}

impl From<tonic::transport::Error> for SyncError {
    fn from(err: tonic::transport::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}
