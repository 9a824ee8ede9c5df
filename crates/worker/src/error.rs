use atelier_core::error::CoreError;
use atelier_core::types::DbId;
use atelier_db::StoreError;

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Job not found: {0}")]
    NotFound(DbId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for WorkerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => Self::InvalidParams(msg),
            CoreError::NotFound { id, .. } => Self::NotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;
