use orchestrate_engine::{ErrorCode, OrchestratorError, StageError};
use orchestrate_identity::IdentityError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Provisioning(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl WorkerError {
    /// Error reported on the bus when a stage fails with this error.
    pub fn to_stage_error(&self) -> StageError {
        let code = match self {
            WorkerError::InvalidParameters(_) => ErrorCode::InvalidParameters,
            WorkerError::Identity(IdentityError::NotRegistered(_))
            | WorkerError::Identity(IdentityError::NotFound(_)) => ErrorCode::NotRegistered,
            WorkerError::Conflict(_) => ErrorCode::AlreadyExists,
            _ => ErrorCode::StageFailed,
        };
        StageError::new(code, self.to_string())
    }

    /// Errors of the worker's own storage are retried by redelivery instead
    /// of being reported as a stage failure.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            WorkerError::Database(_)
                | WorkerError::Orchestrator(OrchestratorError::Database(_))
                | WorkerError::Identity(IdentityError::Database(_))
                | WorkerError::Identity(IdentityError::Crypto(_))
        )
    }
}
