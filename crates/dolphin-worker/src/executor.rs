//! Job executor.
//!
//! The poll loop takes an admission slot before it dequeues, so a denied
//! worker never touches the job and it stays `Waiting`. Each dequeued job
//! runs on its own task: pipeline, artifact cleanup, outcome, slot release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use dolphin_models::{ErrorKind, JobId, JobKind, JobRecord, JobResult, JobState};
use dolphin_queue::{AdmissionGate, AdmissionSlot, JobStore, ProgressReporter, QueueResult};

use crate::artifacts::{self, TempArtifacts};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::pipeline::{Pipeline, StageContext};
use crate::retry::RetryDecision;

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed(JobResult),
    /// Requeued as attempt `attempt` after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        kind: ErrorKind,
    },
    Failed { kind: ErrorKind },
    /// The lease moved to another worker; nothing was recorded.
    Abandoned,
}

/// Aborts the wrapped task when dropped, including during a panic unwind.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State shared with spawned job tasks.
struct Shared {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    gate: Arc<dyn AdmissionGate>,
    lease: Duration,
    pipelines: HashMap<JobKind, Arc<dyn Pipeline>>,
    worker_id: String,
}

impl Shared {
    async fn run_attempt(&self, job: JobRecord) -> WorkerResult<AttemptOutcome> {
        let logger = JobLogger::new(&job.id, job.kind, job.attempt);
        let span = logger.create_span();
        self.attempt_inner(job, logger).instrument(span).await
    }

    async fn attempt_inner(&self, job: JobRecord, logger: JobLogger) -> WorkerResult<AttemptOutcome> {
        logger.log_start(&format!("{}/{}", job.attempt, job.max_attempts));
        metrics::record_job_started(job.kind);
        let started = Instant::now();

        let pipeline = match self.pipelines.get(&job.kind) {
            Some(pipeline) => Arc::clone(pipeline),
            None => {
                let err = WorkerError::validation(format!("no pipeline for {}", job.kind));
                return self.record_failure(&job, &logger, err).await;
            }
        };

        let artifacts = match TempArtifacts::create(&self.config.work_dir, &job.id, job.attempt).await {
            Ok(artifacts) => artifacts,
            Err(e) => return self.record_failure(&job, &logger, e).await,
        };
        let ctx = StageContext::new(
            ProgressReporter::new(Arc::clone(&self.store), job.id.clone(), self.worker_id.clone()),
            artifacts,
            logger.clone(),
        );

        let result = pipeline.run(&job, &ctx).await;
        // Artifacts go before the outcome becomes visible.
        ctx.artifacts.cleanup().await;

        match result {
            Ok(result) => {
                let committed = self.store.complete(&job.id, &self.worker_id, &result).await;
                match settle(committed)? {
                    Some(()) => {
                        metrics::record_job_completed(job.kind, started.elapsed().as_secs_f64());
                        Ok(AttemptOutcome::Completed(result))
                    }
                    None => {
                        logger.log_warning("lease lost before completion was recorded");
                        Ok(AttemptOutcome::Abandoned)
                    }
                }
            }
            Err(e) => self.record_failure(&job, &logger, e).await,
        }
    }

    /// Apply the retry policy to a failed attempt.
    async fn record_failure(
        &self,
        job: &JobRecord,
        logger: &JobLogger,
        err: WorkerError,
    ) -> WorkerResult<AttemptOutcome> {
        if err.is_lease_lost() {
            logger.log_warning("lease lost mid-attempt, abandoning");
            return Ok(AttemptOutcome::Abandoned);
        }

        let kind = err.kind();
        logger.log_error(&err.to_string());

        let policy = self
            .config
            .retry_policy(job.kind)
            .with_max_attempts(job.max_attempts);

        match policy.decide(job.attempt, kind) {
            RetryDecision::Retry(delay) => {
                let scheduled = self
                    .store
                    .schedule_retry(&job.id, &self.worker_id, delay, err.public_reason())
                    .await;
                let Some(attempt) = settle(scheduled)? else {
                    return Ok(AttemptOutcome::Abandoned);
                };
                metrics::record_retry_scheduled(job.kind, kind);
                info!(
                    job_id = %job.id,
                    next_attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    error_kind = %kind,
                    "Retry scheduled"
                );
                Ok(AttemptOutcome::Retrying {
                    attempt,
                    delay,
                    kind,
                })
            }
            RetryDecision::Fail => {
                let failed = self
                    .store
                    .fail(&job.id, &self.worker_id, err.public_reason())
                    .await;
                if settle(failed)?.is_none() {
                    return Ok(AttemptOutcome::Abandoned);
                }
                metrics::record_job_failed(job.kind, kind);
                warn!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    error_kind = %kind,
                    "Job failed terminally"
                );
                Ok(AttemptOutcome::Failed { kind })
            }
        }
    }

    /// Settle a job whose previous owner stopped renewing its lease.
    async fn recover(&self, job: JobRecord) -> WorkerResult<AttemptOutcome> {
        artifacts::remove_job_dir(&self.config.work_dir, &job.id).await;
        let logger = JobLogger::new(&job.id, job.kind, job.attempt);
        let err = WorkerError::transient("worker stopped renewing its lease mid-attempt");
        self.record_failure(&job, &logger, err).await
    }

    async fn maintain(&self) -> WorkerResult<usize> {
        let promoted = self.store.promote_due().await?;
        if promoted > 0 {
            debug!(promoted, "Promoted delayed jobs");
        }

        let reaped = self.store.reap_expired(&self.worker_id, self.lease).await?;
        let count = reaped.len();
        if count > 0 {
            warn!(count, "Recovering jobs with expired leases");
            metrics::record_jobs_reaped(count);
        }
        for job in reaped {
            let job_id = job.id.clone();
            if let Err(e) = self.recover(job).await {
                error!(job_id = %job_id, "Failed to recover job: {}", e);
            }
        }

        match self.gate.active_count().await {
            Ok(active) => metrics::set_admission_active(active),
            Err(e) => debug!("Failed to read admission count: {}", e),
        }
        Ok(count)
    }

    /// Remove job directories that no live attempt owns.
    async fn sweep_work_dir(&self) -> WorkerResult<usize> {
        let mut removed = 0;
        for job_id in artifacts::list_job_dirs(&self.config.work_dir).await? {
            let live = matches!(
                self.store.get(&job_id).await?,
                Some(ref record) if record.state == JobState::Active
            );
            if !live {
                artifacts::remove_job_dir(&self.config.work_dir, &job_id).await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Treat a lost lease as "someone else owns this now".
fn settle<T>(result: QueueResult<T>) -> WorkerResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_lease_lost() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Renew the job lease and the admission slot until aborted.
async fn keep_alive(shared: Arc<Shared>, job_id: JobId, holder: String) {
    let period = shared.config.lease_renew_interval.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        match shared
            .store
            .renew_lease(&job_id, &shared.worker_id, shared.lease)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job_id, "Lease no longer held"),
            Err(e) => warn!(job_id = %job_id, "Failed to renew lease: {}", e),
        }
        match shared.gate.renew(&holder).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job_id, holder = %holder, "Admission slot expired"),
            Err(e) => warn!(job_id = %job_id, "Failed to renew admission slot: {}", e),
        }
    }
}

async fn run_job(shared: Arc<Shared>, job: JobRecord, slot: AdmissionSlot, _permit: OwnedSemaphorePermit) {
    let job_id = job.id.clone();
    let keeper = AbortOnDrop(tokio::spawn(keep_alive(
        Arc::clone(&shared),
        job_id.clone(),
        slot.holder().to_string(),
    )));

    match shared.run_attempt(job).await {
        Ok(outcome) => debug!(job_id = %job_id, ?outcome, "Attempt finished"),
        // The lease lapses and the reaper settles the job.
        Err(e) => error!(job_id = %job_id, "Failed to record attempt outcome: {}", e),
    }

    drop(keeper);
    slot.release().await;
}

/// Job executor that processes jobs from the store.
pub struct JobExecutor {
    shared: Arc<Shared>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl JobExecutor {
    /// `lease` is how long a dequeued job stays owned without renewal.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        gate: Arc<dyn AdmissionGate>,
        lease: Duration,
        pipelines: Vec<Arc<dyn Pipeline>>,
    ) -> Self {
        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (shutdown, _) = watch::channel(false);
        let pipelines = pipelines
            .into_iter()
            .map(|pipeline| (pipeline.kind(), pipeline))
            .collect();

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                gate,
                lease,
                pipelines,
                worker_id: format!("worker-{}", Uuid::new_v4()),
            }),
            job_semaphore,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    /// Run until [`JobExecutor::shutdown`] is called.
    pub async fn run(&self) -> WorkerResult<()> {
        let config = &self.shared.config;
        info!(
            "Starting job executor '{}' with {} max concurrent jobs",
            self.shared.worker_id, config.max_concurrent_jobs
        );

        tokio::fs::create_dir_all(&config.work_dir).await?;
        match self.shared.sweep_work_dir().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed orphaned job directories"),
            Err(e) => warn!("Failed to sweep work dir: {}", e),
        }

        let maintenance = AbortOnDrop(tokio::spawn(Self::maintenance_loop(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        )));

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping executor");
                break;
            }

            match self.poll_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!("Error polling for jobs: {}", e),
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }

        drop(maintenance);

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Shutdown timeout elapsed with jobs still running");
        }

        info!("Job executor stopped");
        Ok(())
    }

    async fn maintenance_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
        let period = shared.config.reap_interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = shared.maintain().await {
                        warn!("Maintenance pass failed: {}", e);
                    }
                }
            }
        }
    }

    /// Try to start one job. Returns whether a job was started.
    pub async fn poll_once(&self) -> WorkerResult<bool> {
        let Ok(permit) = Arc::clone(&self.job_semaphore).try_acquire_owned() else {
            return Ok(false);
        };

        let slot = match AdmissionSlot::try_acquire(Arc::clone(&self.shared.gate), &self.shared.worker_id).await {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                metrics::record_admission_denied();
                return Ok(false);
            }
            Err(e) => {
                // An unreachable gate denies; it never admits.
                warn!("Admission gate unavailable: {}", e);
                metrics::record_admission_denied();
                return Ok(false);
            }
        };

        let job = match self
            .shared
            .store
            .dequeue(&self.shared.worker_id, self.shared.lease)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                slot.release().await;
                return Ok(false);
            }
            Err(e) => {
                slot.release().await;
                return Err(e.into());
            }
        };

        debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempt, "Dequeued job");
        tokio::spawn(run_job(Arc::clone(&self.shared), job, slot, permit));
        Ok(true)
    }

    /// Run one attempt of a job this worker has already leased.
    ///
    /// Cleans up the attempt's artifacts and records the outcome. Admission
    /// is the caller's concern.
    pub async fn run_attempt(&self, job: JobRecord) -> WorkerResult<AttemptOutcome> {
        self.shared.run_attempt(job).await
    }

    /// Promote due retries and settle jobs with expired leases. Returns how
    /// many jobs were recovered.
    pub async fn maintain(&self) -> WorkerResult<usize> {
        self.shared.maintain().await
    }

    /// Remove work directories of jobs that are not active.
    pub async fn sweep_work_dir(&self) -> WorkerResult<usize> {
        self.shared.sweep_work_dir().await
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.shared.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
