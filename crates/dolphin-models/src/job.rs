//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use validator::Validate;

use crate::name::{normalize_arabic_name, normalize_name};

/// Longest student name accepted at enqueue time. The `validate` attributes
/// below repeat it as a literal because the schema derive only reads literals.
pub const MAX_NAME_LEN: u64 = 100;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is waiting in queue (first attempt or after a retry backoff)
    #[default]
    Waiting,
    /// Job holds an admission slot and a worker is running its stages
    Active,
    /// Job completed successfully
    Completed,
    /// Job failed terminally
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Terminal states are never reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(PayloadError::UnknownValue(other.to_string())),
        }
    }
}

/// Type of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Personalized narrated video
    VideoGeneration,
    /// Personalized certificate image
    CertificateGeneration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::VideoGeneration => "video_generation",
            JobKind::CertificateGeneration => "certificate_generation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video_generation" => Ok(JobKind::VideoGeneration),
            "certificate_generation" => Ok(JobKind::CertificateGeneration),
            other => Err(PayloadError::UnknownValue(other.to_string())),
        }
    }
}

/// Certificate language variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Ar,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Ar => "ar",
            Language::En => "en",
        }
    }

    /// Whether text in this language runs right-to-left.
    pub fn is_rtl(&self) -> bool {
        matches!(self, Language::Ar)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ar" => Ok(Language::Ar),
            "en" => Ok(Language::En),
            other => Err(PayloadError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Errors raised while validating or decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error("student name is empty after normalization")]
    EmptyName,

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("unknown value: {0}")]
    UnknownValue(String),
}

/// Input for a narrated video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct VideoPayload {
    /// Name spoken in the greeting
    #[validate(length(min = 1, max = 100))]
    pub student_name: String,
}

/// Input for a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct CertificatePayload {
    /// Name drawn onto the template
    #[validate(length(min = 1, max = 100))]
    pub student_name: String,
    /// Template and typography variant
    #[serde(default)]
    pub language: Language,
}

/// Kind-specific immutable job input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    VideoGeneration(VideoPayload),
    CertificateGeneration(CertificatePayload),
}

impl JobPayload {
    /// Build a video payload.
    pub fn video(student_name: impl Into<String>) -> Self {
        JobPayload::VideoGeneration(VideoPayload {
            student_name: student_name.into(),
        })
    }

    /// Build a certificate payload.
    pub fn certificate(student_name: impl Into<String>, language: Language) -> Self {
        JobPayload::CertificateGeneration(CertificatePayload {
            student_name: student_name.into(),
            language,
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::VideoGeneration(_) => JobKind::VideoGeneration,
            JobPayload::CertificateGeneration(_) => JobKind::CertificateGeneration,
        }
    }

    pub fn student_name(&self) -> &str {
        match self {
            JobPayload::VideoGeneration(p) => &p.student_name,
            JobPayload::CertificateGeneration(p) => &p.student_name,
        }
    }

    /// Name as it should be spoken or drawn.
    pub fn display_name(&self) -> String {
        match self {
            JobPayload::VideoGeneration(p) => normalize_name(&p.student_name),
            JobPayload::CertificateGeneration(p) => match p.language {
                Language::Ar => normalize_arabic_name(&p.student_name),
                Language::En => normalize_name(&p.student_name),
            },
        }
    }

    /// Validate field constraints and that the name survives normalization.
    pub fn validate(&self) -> Result<(), PayloadError> {
        let checked = match self {
            JobPayload::VideoGeneration(p) => p.validate(),
            JobPayload::CertificateGeneration(p) => p.validate(),
        };
        checked.map_err(|e| PayloadError::Invalid(e.to_string()))?;

        if self.display_name().is_empty() {
            return Err(PayloadError::EmptyName);
        }
        Ok(())
    }
}

/// Output descriptor of a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    /// Externally addressable download URL
    pub url: String,
    /// Location of the file on the worker's output volume
    pub path: String,
    /// Bare file name
    pub file_name: String,
}

/// A job record as held in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID
    pub id: JobId,

    /// Job type
    pub kind: JobKind,

    /// Immutable input
    pub payload: JobPayload,

    /// Job state
    #[serde(default)]
    pub state: JobState,

    /// Progress (0-100), reset on each retry attempt
    #[serde(default)]
    pub progress: u8,

    /// Current attempt, starting at 1
    pub attempt: u32,

    /// Attempts allowed before terminal failure
    pub max_attempts: u32,

    /// Stage messages, oldest first
    #[serde(default)]
    pub stage_log: Vec<String>,

    /// Result (when completed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,

    /// Public failure reason (when failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Reason of the most recent retryable failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Incremented on every committed write
    #[serde(default)]
    pub version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh waiting record for a payload.
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind: payload.kind(),
            payload,
            state: JobState::Waiting,
            progress: 0,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            stage_log: Vec::new(),
            result: None,
            failure_reason: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}
