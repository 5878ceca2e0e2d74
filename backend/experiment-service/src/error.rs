use thiserror::Error;
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::ExperimentStatus;

pub type Result<T> = std::result::Result<T, ExperimentError>;

/// Experiment service errors
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("Experiment not found: {0}")]
    NotFound(Uuid),

    #[error("Experiment not found by name: {0}")]
    NotFoundByName(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ExperimentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ExperimentError::Validation(msg.into())
    }

    /// Stable machine-readable code for hosts mapping errors onto a transport
    pub fn code(&self) -> &'static str {
        match self {
            ExperimentError::Validation(_) => "VALIDATION_ERROR",
            ExperimentError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ExperimentError::NotFound(_) | ExperimentError::NotFoundByName(_) => "NOT_FOUND",
            ExperimentError::Conflict(_) => "CONFLICT",
            ExperimentError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

impl From<StoreError> for ExperimentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(key) => ExperimentError::Conflict(key),
            StoreError::NotFound(id) => ExperimentError::NotFound(id),
            StoreError::Stale(id) => ExperimentError::Conflict(format!(
                "experiment {} was modified concurrently, retry the update",
                id
            )),
            other => ExperimentError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ExperimentError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ExperimentError::Validation(errors.to_string())
    }
}
