//! Media adapter errors.

use std::path::PathBuf;
use thiserror::Error;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    /// An external binary could not be located on PATH.
    #[error("{0} is not installed or not on PATH")]
    ToolNotFound(&'static str),

    /// An external binary ran and exited unsuccessfully.
    #[error("{tool} failed: {message}")]
    ToolFailed {
        tool: &'static str,
        message: String,
        /// Last lines of stderr, kept out of the display string
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("speech synthesis failed: {message}")]
    SynthesisFailed {
        message: String,
        /// HTTP status, when the service answered
        status: Option<u16>,
    },

    /// A template, font or source clip that must exist before work starts.
    #[error("required asset is missing: {}", .0.display())]
    AssetMissing(PathBuf),

    /// An intermediate file vanished between stages.
    #[error("expected file is missing: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("unusable media: {0}")]
    InvalidMedia(String),

    #[error("adapter misconfigured: {0}")]
    Config(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

impl MediaError {
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr_tail: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ToolFailed {
            tool: "ffmpeg",
            message: message.into(),
            stderr_tail,
            exit_code,
        }
    }

    pub fn ffprobe_failed(message: impl Into<String>, stderr_tail: Option<String>) -> Self {
        Self::ToolFailed {
            tool: "ffprobe",
            message: message.into(),
            stderr_tail,
            exit_code: None,
        }
    }

    pub fn synthesis_failed(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::SynthesisFailed {
            message: message.into(),
            status,
        }
    }

    pub fn invalid_media(message: impl Into<String>) -> Self {
        Self::InvalidMedia(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Captured stderr of a failed tool run.
    pub fn stderr_tail(&self) -> Option<&str> {
        match self {
            MediaError::ToolFailed { stderr_tail, .. } => stderr_tail.as_deref(),
            _ => None,
        }
    }
}
