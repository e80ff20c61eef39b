//! Structured job logging.

use tracing::{error, info, warn, Span};

use dolphin_models::{JobId, JobKind};

/// Logger bound to one attempt of one job.
///
/// Every event carries `job_id`, `kind` and `attempt`, so one attempt can be
/// followed through the logs of a busy worker.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    kind: JobKind,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_id: &JobId, kind: JobKind, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            kind,
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            attempt = self.attempt,
            "Attempt started: {}", message
        );
    }

    /// Log entry into a stage.
    pub fn log_stage(&self, stage: &str, progress: u8) {
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            attempt = self.attempt,
            stage,
            progress,
            "Stage started"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            kind = %self.kind,
            attempt = self.attempt,
            "Attempt warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            kind = %self.kind,
            attempt = self.attempt,
            "Attempt failed: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            kind = %self.kind,
            attempt = self.attempt,
            "Artifact published: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span covering the whole attempt.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            kind = %self.kind,
            attempt = self.attempt
        )
    }
}
