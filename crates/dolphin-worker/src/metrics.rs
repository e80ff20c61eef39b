//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use dolphin_models::{ErrorKind, JobKind};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "dolphin_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "dolphin_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "dolphin_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "dolphin_jobs_retried_total";
    pub const JOBS_REAPED_TOTAL: &str = "dolphin_jobs_reaped_total";
    pub const ATTEMPT_DURATION_SECONDS: &str = "dolphin_attempt_duration_seconds";
    pub const STAGE_DURATION_SECONDS: &str = "dolphin_stage_duration_seconds";
    pub const ADMISSION_ACTIVE_SLOTS: &str = "dolphin_admission_active_slots";
    pub const ADMISSION_DENIED_TOTAL: &str = "dolphin_admission_denied_total";
}

/// Install the recorder and serve `/metrics` on `addr`.
///
/// Must be called from inside the Tokio runtime.
pub fn install_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

pub fn record_job_started(kind: JobKind) {
    counter!(names::JOBS_STARTED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_job_completed(kind: JobKind, duration_secs: f64) {
    counter!(names::JOBS_COMPLETED_TOTAL, "kind" => kind.as_str()).increment(1);
    histogram!(names::ATTEMPT_DURATION_SECONDS, "kind" => kind.as_str()).record(duration_secs);
}

pub fn record_job_failed(kind: JobKind, error: ErrorKind) {
    counter!(
        names::JOBS_FAILED_TOTAL,
        "kind" => kind.as_str(),
        "error" => error.as_str()
    )
    .increment(1);
}

pub fn record_retry_scheduled(kind: JobKind, error: ErrorKind) {
    counter!(
        names::JOBS_RETRIED_TOTAL,
        "kind" => kind.as_str(),
        "error" => error.as_str()
    )
    .increment(1);
}

pub fn record_jobs_reaped(count: usize) {
    counter!(names::JOBS_REAPED_TOTAL).increment(count as u64);
}

pub fn record_stage_duration(kind: JobKind, stage: &'static str, duration_secs: f64) {
    histogram!(
        names::STAGE_DURATION_SECONDS,
        "kind" => kind.as_str(),
        "stage" => stage
    )
    .record(duration_secs);
}

pub fn set_admission_active(count: usize) {
    gauge!(names::ADMISSION_ACTIVE_SLOTS).set(count as f64);
}

pub fn record_admission_denied() {
    counter!(names::ADMISSION_DENIED_TOTAL).increment(1);
}
