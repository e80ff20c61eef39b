//! In-process job store.
//!
//! Mirrors the Redis store's transitions and lease rules so executor tests and
//! single-process deployments behave exactly like the shared store. Deadlines
//! use `tokio::time::Instant`, so tests can drive backoff and lease expiry
//! with a paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use dolphin_models::{JobId, JobPayload, JobRecord, JobResult, JobState};

use crate::error::{QueueError, QueueResult};
use crate::store::{prepare_record, retry_log_line, JobStore, QueueDepth};

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

impl Lease {
    fn is_held_by(&self, worker_id: &str) -> bool {
        self.owner == worker_id && self.expires_at > Instant::now()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobRecord>,
    waiting: VecDeque<JobId>,
    active: Vec<JobId>,
    delayed: Vec<(Instant, JobId)>,
    leases: HashMap<JobId, Lease>,
}

impl MemoryState {
    /// Borrow an active job owned by `worker_id`.
    fn owned_active(&mut self, id: &JobId, worker_id: &str) -> QueueResult<&mut JobRecord> {
        let owned = self
            .leases
            .get(id)
            .map(|lease| lease.is_held_by(worker_id))
            .unwrap_or(false);
        if !owned {
            return Err(QueueError::LeaseLost(id.clone()));
        }

        let record = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if record.state != JobState::Active {
            return Err(QueueError::invalid_transition(id, "transition"));
        }
        Ok(record)
    }

    fn release(&mut self, id: &JobId) {
        self.active.retain(|active| active != id);
        self.leases.remove(id);
    }
}

/// Job store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, payload: JobPayload, max_attempts: u32) -> QueueResult<JobRecord> {
        let record = prepare_record(payload, max_attempts)?;
        let mut state = self.lock();
        state.waiting.push_back(record.id.clone());
        state.jobs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn dequeue(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<JobRecord>> {
        let mut state = self.lock();

        while let Some(id) = state.waiting.pop_front() {
            let is_waiting = state
                .jobs
                .get(&id)
                .map(|r| r.state == JobState::Waiting)
                .unwrap_or(false);
            if !is_waiting {
                continue;
            }

            state.leases.insert(
                id.clone(),
                Lease {
                    owner: worker_id.to_string(),
                    expires_at: Instant::now() + lease,
                },
            );
            state.active.push(id.clone());

            let record = state
                .jobs
                .get_mut(&id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;
            record.state = JobState::Active;
            record.progress = 0;
            record.updated_at = Utc::now();
            record.version += 1;
            return Ok(Some(record.clone()));
        }

        Ok(None)
    }

    async fn report_progress(
        &self,
        id: &JobId,
        worker_id: &str,
        progress: u8,
        message: &str,
    ) -> QueueResult<u64> {
        let mut state = self.lock();
        let record = state.owned_active(id, worker_id)?;

        record.progress = record.progress.max(progress.min(100));
        if !message.is_empty() {
            record.stage_log.push(message.to_string());
        }
        record.updated_at = Utc::now();
        record.version += 1;
        Ok(record.version)
    }

    async fn renew_lease(&self, id: &JobId, worker_id: &str, lease: Duration) -> QueueResult<bool> {
        let mut state = self.lock();
        match state.leases.get_mut(id) {
            Some(held) if held.is_held_by(worker_id) => {
                held.expires_at = Instant::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: &JobId, worker_id: &str, result: &JobResult) -> QueueResult<()> {
        let mut state = self.lock();
        let record = state.owned_active(id, worker_id)?;

        record.state = JobState::Completed;
        record.progress = 100;
        record.result = Some(result.clone());
        record.updated_at = Utc::now();
        record.version += 1;

        state.release(id);
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &JobId,
        worker_id: &str,
        delay: Duration,
        reason: &str,
    ) -> QueueResult<u32> {
        let mut state = self.lock();
        let record = state.owned_active(id, worker_id)?;
        if !record.has_attempts_left() {
            return Err(QueueError::invalid_transition(id, "retry"));
        }

        record.attempt += 1;
        record.progress = 0;
        record.state = JobState::Waiting;
        record.last_error = Some(reason.to_string());
        record.stage_log.push(retry_log_line(record.attempt, delay));
        record.updated_at = Utc::now();
        record.version += 1;
        let attempt = record.attempt;

        state.release(id);
        state.delayed.push((Instant::now() + delay, id.clone()));
        Ok(attempt)
    }

    async fn fail(&self, id: &JobId, worker_id: &str, reason: &str) -> QueueResult<()> {
        let mut state = self.lock();
        let record = state.owned_active(id, worker_id)?;

        record.state = JobState::Failed;
        record.failure_reason = Some(reason.to_string());
        record.updated_at = Utc::now();
        record.version += 1;

        state.release(id);
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut state = self.lock();
        let now = Instant::now();

        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(ready_at, _)| *ready_at <= now);
        state.delayed = pending;

        let count = due.len();
        for (_, id) in due {
            state.waiting.push_back(id);
        }
        Ok(count)
    }

    async fn reap_expired(&self, worker_id: &str, lease: Duration) -> QueueResult<Vec<JobRecord>> {
        let mut state = self.lock();
        let now = Instant::now();

        let expired: Vec<JobId> = state
            .active
            .iter()
            .filter(|id| {
                state
                    .leases
                    .get(*id)
                    .map(|l| l.expires_at <= now)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let mut reaped = Vec::new();
        for id in expired {
            let record = match state.jobs.get(&id) {
                Some(record) if record.state == JobState::Active => record.clone(),
                _ => {
                    state.release(&id);
                    continue;
                }
            };
            state.leases.insert(
                id,
                Lease {
                    owner: worker_id.to_string(),
                    expires_at: now + lease,
                },
            );
            reaped.push(record);
        }
        Ok(reaped)
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let state = self.lock();
        Ok(QueueDepth {
            waiting: state.waiting.len() as u64,
            delayed: state.delayed.len() as u64,
            active: state.active.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    async fn enqueue_video(store: &MemoryJobStore, max_attempts: u32) -> JobRecord {
        store
            .enqueue(JobPayload::video("Omar"), max_attempts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let store = MemoryJobStore::new();
        let err = store.enqueue(JobPayload::video("   "), 3).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(store.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn test_dequeue_marks_active_and_leases() {
        let store = MemoryJobStore::new();
        let job = enqueue_video(&store, 3).await;

        let taken = store.dequeue("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(taken.id, job.id);
        assert_eq!(taken.state, JobState::Active);

        // Only one worker may own the job.
        assert!(store.dequeue("w2", LEASE).await.unwrap().is_none());
        let err = store
            .report_progress(&job.id, "w2", 10, "stolen")
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_progress_never_decreases_within_attempt() {
        let store = MemoryJobStore::new();
        let job = enqueue_video(&store, 3).await;
        store.dequeue("w1", LEASE).await.unwrap();

        let v1 = store.report_progress(&job.id, "w1", 50, "half").await.unwrap();
        let v2 = store.report_progress(&job.id, "w1", 30, "late").await.unwrap();
        store.report_progress(&job.id, "w1", 250, "").await.unwrap();

        let record = store.get(&job.id).await.unwrap().unwrap();
        assert!(v2 > v1);
        assert_eq!(record.progress, 100);
        assert_eq!(record.stage_log, vec!["half", "late"]);
    }

    #[tokio::test]
    async fn test_retry_resets_progress_and_waits_for_backoff() {
        tokio::time::pause();
        let store = MemoryJobStore::new();
        let job = enqueue_video(&store, 3).await;
        store.dequeue("w1", LEASE).await.unwrap();
        store.report_progress(&job.id, "w1", 50, "half").await.unwrap();

        let attempt = store
            .schedule_retry(&job.id, "w1", Duration::from_secs(5), "ffmpeg exited 1")
            .await
            .unwrap();
        assert_eq!(attempt, 2);

        let record = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.progress, 0);

        assert_eq!(store.promote_due().await.unwrap(), 0);
        assert!(store.dequeue("w1", LEASE).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.promote_due().await.unwrap(), 1);
        let again = store.dequeue("w1", LEASE).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_refused_on_last_attempt() {
        let store = MemoryJobStore::new();
        let job = enqueue_video(&store, 1).await;
        store.dequeue("w1", LEASE).await.unwrap();

        let err = store
            .schedule_retry(&job.id, "w1", Duration::ZERO, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let store = MemoryJobStore::new();
        let job = enqueue_video(&store, 3).await;
        store.dequeue("w1", LEASE).await.unwrap();

        let result = JobResult {
            url: "http://localhost/api/videos/download/a.mp4".into(),
            path: "/out/a.mp4".into(),
            file_name: "a.mp4".into(),
        };
        store.complete(&job.id, "w1", &result).await.unwrap();

        let record = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.progress, 100);
        assert!(store.fail(&job.id, "w1", "late").await.is_err());
        assert_eq!(store.depth().await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_reap_releases_jobs_of_dead_workers() {
        tokio::time::pause();
        let store = MemoryJobStore::new();
        let job = enqueue_video(&store, 3).await;
        store.dequeue("crashed", Duration::from_secs(10)).await.unwrap();

        assert!(store.reap_expired("w2", LEASE).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let reaped = store.reap_expired("w2", LEASE).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, job.id);

        // The reaper now owns the job; the crashed worker does not.
        assert!(store.renew_lease(&job.id, "w2", LEASE).await.unwrap());
        assert!(!store.renew_lease(&job.id, "crashed", LEASE).await.unwrap());
    }
}
