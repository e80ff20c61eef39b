//! Shared data models for the Dolphin media worker.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, payloads and results
//! - Job states and the error taxonomy
//! - The read-only status view served to polling clients
//! - Student name normalization

pub mod error_kind;
pub mod job;
pub mod name;
pub mod status;

// Re-export common types
pub use error_kind::ErrorKind;
pub use job::{
    CertificatePayload, JobId, JobKind, JobPayload, JobRecord, JobResult, JobState, Language,
    PayloadError, VideoPayload,
};
pub use name::{normalize_arabic_name, normalize_name};
pub use status::JobStatusView;
