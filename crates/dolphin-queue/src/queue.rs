//! Enqueue API used by request handlers.

use std::sync::Arc;

use tracing::info;

use dolphin_models::{JobPayload, JobRecord, Language};

use crate::config::AttemptLimits;
use crate::error::QueueResult;
use crate::store::{JobStore, QueueDepth};

/// Job queue client.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    limits: AttemptLimits,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, limits: AttemptLimits) -> Self {
        Self { store, limits }
    }

    /// Enqueue a narrated video job.
    pub async fn enqueue_video(&self, student_name: impl Into<String>) -> QueueResult<JobRecord> {
        self.enqueue(JobPayload::video(student_name)).await
    }

    /// Enqueue a certificate job.
    pub async fn enqueue_certificate(
        &self,
        student_name: impl Into<String>,
        language: Language,
    ) -> QueueResult<JobRecord> {
        self.enqueue(JobPayload::certificate(student_name, language))
            .await
    }

    async fn enqueue(&self, payload: JobPayload) -> QueueResult<JobRecord> {
        let max_attempts = self.limits.for_kind(payload.kind());
        let record = self.store.enqueue(payload, max_attempts).await?;
        info!(job_id = %record.id, kind = %record.kind, "Job accepted");
        Ok(record)
    }

    pub async fn depth(&self) -> QueueResult<QueueDepth> {
        self.store.depth().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::memory::MemoryJobStore;
    use dolphin_models::JobKind;

    fn queue() -> JobQueue {
        JobQueue::new(
            Arc::new(MemoryJobStore::new()),
            AttemptLimits {
                video: 3,
                certificate: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_attempts_follow_job_kind() {
        let queue = queue();
        let video = queue.enqueue_video("Omar").await.unwrap();
        let cert = queue
            .enqueue_certificate("عمر", Language::Ar)
            .await
            .unwrap();

        assert_eq!(video.kind, JobKind::VideoGeneration);
        assert_eq!(video.max_attempts, 3);
        assert_eq!(cert.max_attempts, 5);
        assert_eq!(queue.depth().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let err = queue().enqueue_video("  ").await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }
}
