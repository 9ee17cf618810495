//! Error taxonomy of the orchestration core
//!
//! Only the store variants escape `Orchestrator::handle`; everything else is
//! turned into a user-facing reply and logged by its `kind()`.

use crate::backend::{BackendError, BackendOperation};
use crate::jobs::JobError;
use crate::rate_limit::CommandClass;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("User {0} is not authorized")]
    AuthRejected(String),
    #[error("Rate limit exceeded for {class}, retry after {retry_after:?}")]
    RateLimitExceeded {
        class: CommandClass,
        retry_after: Duration,
    },
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("Backend {operation} failed: {error}")]
    Backend {
        operation: BackendOperation,
        error: BackendError,
    },
    #[error("Job not found: {0}")]
    JobNotFound(String),
    #[error("Session store unavailable: {0}")]
    SessionStoreUnavailable(#[source] StoreError),
    #[error("Job store unavailable: {0}")]
    JobStoreUnavailable(#[source] StoreError),
}

impl CoreError {
    /// Machine-readable tag for logs and API bodies
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::AuthRejected(_) => "auth_rejected",
            CoreError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            CoreError::InvalidStateTransition(_) => "invalid_state_transition",
            CoreError::Backend { error, .. } => error.kind.as_str(),
            CoreError::JobNotFound(_) => "job_not_found",
            CoreError::SessionStoreUnavailable(_) => "session_store_unavailable",
            CoreError::JobStoreUnavailable(_) => "job_store_unavailable",
        }
    }
}

impl From<JobError> for CoreError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound(job_id) => CoreError::JobNotFound(job_id),
            JobError::Store(store) => CoreError::JobStoreUnavailable(store),
            other @ (JobError::Duplicate(_) | JobError::InvalidTransition { .. }) => {
                CoreError::InvalidStateTransition(other.to_string())
            }
        }
    }
}
