//! Stage progress reporting.

use std::sync::Arc;

use tracing::debug;

use dolphin_models::JobId;

use crate::error::QueueResult;
use crate::store::JobStore;

/// Capability handed to pipeline stages for one leased job.
///
/// Every checkpoint is a lease-guarded, versioned write to the store, so a
/// worker that lost its lease learns it at the next stage boundary.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    worker_id: String,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id,
            worker_id: worker_id.into(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Record a stage checkpoint. Returns the record version after the write.
    pub async fn checkpoint(&self, progress: u8, message: &str) -> QueueResult<u64> {
        let version = self
            .store
            .report_progress(&self.job_id, &self.worker_id, progress, message)
            .await?;
        debug!(job_id = %self.job_id, progress, version, "{}", message);
        Ok(version)
    }
}
