//! Generation worker.
//!
//! This crate provides:
//! - Job executor with cross-process admission and lease renewal
//! - Video and certificate pipelines with staged progress
//! - Retry policy and failure classification
//! - Per-attempt temporary artifacts
//! - Graceful shutdown

pub mod artifacts;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use artifacts::TempArtifacts;
pub use config::{AssetConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::{AttemptOutcome, JobExecutor};
pub use logging::JobLogger;
pub use pipeline::{CertificatePipeline, Pipeline, StageContext, VideoPipeline};
pub use retry::{RetryDecision, RetryPolicy};
