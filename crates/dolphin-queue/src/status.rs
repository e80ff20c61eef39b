//! Read-only job status projection for polling clients.

use std::sync::Arc;

use dolphin_models::{JobId, JobStatusView};

use crate::error::{QueueError, QueueResult};
use crate::store::JobStore;

/// Answers status polls without ever writing to the store.
#[derive(Clone)]
pub struct JobStatusFacade {
    store: Arc<dyn JobStore>,
}

impl JobStatusFacade {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, id: &JobId) -> QueueResult<JobStatusView> {
        self.store
            .get(id)
            .await?
            .map(JobStatusView::from)
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }
}
