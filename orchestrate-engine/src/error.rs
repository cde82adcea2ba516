use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes shared by the API surface and persisted request errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    PermissionDenied,
    NotRegistered,
    InvalidParameters,
    NotFound,
    AlreadyExists,
    StageFailed,
    Timeout,
    Ineffective,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::NotRegistered => "not_registered",
            ErrorCode::InvalidParameters => "invalid_parameters",
            ErrorCode::NotFound => "not_found",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::StageFailed => "stage_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Ineffective => "ineffective",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::NotFound(_) => ErrorCode::NotFound,
            OrchestratorError::InvalidParameters(_) => ErrorCode::InvalidParameters,
            _ => ErrorCode::Internal,
        }
    }
}
