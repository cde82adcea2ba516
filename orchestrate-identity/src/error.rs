use orchestrate_engine::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Project {0} already has a service account")]
    AlreadyExists(String),

    #[error("No trust record for project {0}")]
    NotFound(String),

    #[error("Project {0} is not registered")]
    NotRegistered(String),

    #[error("Invalid or missing API key")]
    Unauthenticated,

    #[error("Invalid project: {0}")]
    InvalidProject(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IAM backend error: {0}")]
    Backend(String),
}

impl IdentityError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IdentityError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            IdentityError::NotFound(_) => ErrorCode::NotFound,
            IdentityError::NotRegistered(_) => ErrorCode::NotRegistered,
            IdentityError::Unauthenticated => ErrorCode::Unauthenticated,
            IdentityError::InvalidProject(_) => ErrorCode::InvalidParameters,
            IdentityError::Database(_) | IdentityError::Crypto(_) | IdentityError::Backend(_) => {
                ErrorCode::Internal
            }
        }
    }
}
