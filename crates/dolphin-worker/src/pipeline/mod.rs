//! Generation pipelines.
//!
//! A pipeline runs its stages strictly in order. Each stage reports its
//! checkpoint through [`StageContext::enter`] before doing any work, so a
//! status reader sees the work that is about to happen.

mod certificate;
mod video;

pub use certificate::{CertificatePipeline, CertificateStage};
pub use video::{extension_duration, VideoPipeline, VideoStage, EXTENSION_TOLERANCE_SECS, MAX_EXTENSION_SECS};

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use dolphin_models::{JobKind, JobRecord, JobResult};
use dolphin_queue::ProgressReporter;

use crate::artifacts::TempArtifacts;
use crate::error::WorkerResult;
use crate::logging::JobLogger;
use crate::metrics;

/// One kind of generation work.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Run every stage of one attempt.
    async fn run(&self, job: &JobRecord, ctx: &StageContext) -> WorkerResult<JobResult>;
}

/// Everything a stage needs from the attempt that runs it.
pub struct StageContext {
    pub progress: ProgressReporter,
    pub artifacts: TempArtifacts,
    pub logger: JobLogger,
}

impl StageContext {
    pub fn new(progress: ProgressReporter, artifacts: TempArtifacts, logger: JobLogger) -> Self {
        Self {
            progress,
            artifacts,
            logger,
        }
    }

    /// Report the stage checkpoint and start timing it.
    pub async fn enter(&self, stage: &'static str, progress: u8, message: &str) -> WorkerResult<StageTimer> {
        self.logger.log_stage(stage, progress);
        self.progress.checkpoint(progress, message).await?;
        Ok(StageTimer {
            kind: self.logger.kind(),
            stage,
            started: Instant::now(),
        })
    }
}

/// Records the stage duration when finished.
#[must_use]
pub struct StageTimer {
    kind: JobKind,
    stage: &'static str,
    started: Instant,
}

impl StageTimer {
    pub fn finish(self) {
        metrics::record_stage_duration(self.kind, self.stage, self.started.elapsed().as_secs_f64());
    }
}

/// Hidden sibling of `final_path` that keeps its extension, so tools that
/// infer the container from the name still work.
pub(crate) fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}.partial.{}", Uuid::new_v4().simple(), name))
}

#[cfg(test)]
pub(crate) mod fakes;
