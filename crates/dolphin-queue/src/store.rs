//! Durable job store contract.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dolphin_models::{JobId, JobPayload, JobRecord, JobResult};

use crate::error::QueueResult;

/// Number of jobs in each queue position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
}

/// Shared, persistent home of every job record.
///
/// Every state transition after `dequeue` is guarded by the lease taken at
/// dequeue time: a worker that no longer owns the lease gets
/// [`QueueError::LeaseLost`](crate::QueueError::LeaseLost) and must stop
/// touching the job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate the payload and persist a new waiting job.
    async fn enqueue(&self, payload: JobPayload, max_attempts: u32) -> QueueResult<JobRecord>;

    /// Take the oldest waiting job, lease it to `worker_id` and mark it active.
    async fn dequeue(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<JobRecord>>;

    /// Record a stage checkpoint. Returns the record version after the write.
    async fn report_progress(
        &self,
        id: &JobId,
        worker_id: &str,
        progress: u8,
        message: &str,
    ) -> QueueResult<u64>;

    /// Extend the lease. Returns false when the lease is no longer owned.
    async fn renew_lease(&self, id: &JobId, worker_id: &str, lease: Duration) -> QueueResult<bool>;

    /// Attach the result and move the job to `Completed`.
    async fn complete(&self, id: &JobId, worker_id: &str, result: &JobResult) -> QueueResult<()>;

    /// Return the job to `Waiting` after `delay` with the next attempt number.
    /// Returns the new attempt number.
    async fn schedule_retry(
        &self,
        id: &JobId,
        worker_id: &str,
        delay: Duration,
        reason: &str,
    ) -> QueueResult<u32>;

    /// Move the job to terminal `Failed` with a public reason.
    async fn fail(&self, id: &JobId, worker_id: &str, reason: &str) -> QueueResult<()>;

    /// Move delayed jobs whose backoff elapsed back to the waiting list.
    async fn promote_due(&self) -> QueueResult<usize>;

    /// Re-lease active jobs whose owner stopped renewing to `worker_id`.
    async fn reap_expired(&self, worker_id: &str, lease: Duration) -> QueueResult<Vec<JobRecord>>;

    /// Read a job, including its stage log.
    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>>;

    async fn depth(&self) -> QueueResult<QueueDepth>;
}

/// Validate a payload and build the record that `enqueue` persists.
pub(crate) fn prepare_record(payload: JobPayload, max_attempts: u32) -> QueueResult<JobRecord> {
    payload.validate()?;
    Ok(JobRecord::new(payload, max_attempts))
}

/// Stage log line appended when a retry is scheduled.
pub(crate) fn retry_log_line(next_attempt: impl std::fmt::Display, delay: Duration) -> String {
    format!(
        "Retrying (attempt {}) in {:.1}s",
        next_attempt,
        delay.as_secs_f64()
    )
}
