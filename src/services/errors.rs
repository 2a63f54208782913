//! Error taxonomy shared by the repositories and the lifecycle coordinator.

use crate::services::attachment_store::StorageError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Failures of the relational store.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Absent, or owned by somebody else. The two are never distinguished.
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A file that could not be uploaded or registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    /// URL for registrations, zero-based input position for uploads.
    pub file: String,
    pub reason: String,
}

/// Mixed outcome of a multi-file step. `succeeded` lists what the caller
/// must not upload or register again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialFailure {
    /// Record the files were meant for, if it exists.
    pub maintenance_id: Option<Uuid>,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Repository(RepositoryError),
    #[error("{} of {} files failed", .0.failed.len(), .0.failed.len() + .0.succeeded.len())]
    PartialFailure(Box<PartialFailure>),
}

impl From<RepositoryError> for LifecycleError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => LifecycleError::NotFound,
            other => LifecycleError::Repository(other),
        }
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
