use sunstone_core::{StoreError, UnknownMode};

use crate::runner::{CancelError, LaunchError};
use crate::validate::ValidationError;

/// Errors surfaced by [`super::RunService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    UnsupportedMode(#[from] UnknownMode),

    #[error("local execution disabled")]
    LocalExecutionDisabled,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {0} has not been submitted")]
    NotSubmitted(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Worker launch failed: {0}")]
    Launch(#[source] LaunchError),

    #[error("cancel failed: {0}")]
    Cancel(#[source] CancelError),

    #[error("storage error: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            ServiceError::NotFound(err.to_string())
        } else {
            ServiceError::Store(err)
        }
    }
}

impl ServiceError {
    /// HTTP-equivalent status code.
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::InvalidRequest(_)
            | ServiceError::UnsupportedMode(_)
            | ServiceError::Validation(_)
            | ServiceError::NotSubmitted(_) => 400,
            ServiceError::LocalExecutionDisabled => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::Launch(_) | ServiceError::Cancel(_) | ServiceError::Store(_) => 500,
        }
    }
}
