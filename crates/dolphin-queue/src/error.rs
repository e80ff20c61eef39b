//! Queue error types.

use dolphin_models::{JobId, PayloadError};
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Validation failed: {0}")]
    Validation(#[from] PayloadError),

    #[error("Lease lost for job {0}")]
    LeaseLost(JobId),

    #[error("Job {job_id} cannot {action} from its current state")]
    InvalidTransition { job_id: JobId, action: &'static str },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn invalid_transition(job_id: &JobId, action: &'static str) -> Self {
        Self::InvalidTransition {
            job_id: job_id.clone(),
            action,
        }
    }

    /// Whether the caller lost ownership of the job it was working on.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, QueueError::LeaseLost(_))
    }
}
