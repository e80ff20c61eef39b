//! Worker error types.
//!
//! Every stage error carries its [`ErrorKind`] from the moment it is built.
//! The executor reads the kind to pick the next state; it never inspects
//! message text.

use thiserror::Error;

use dolphin_media::MediaError;
use dolphin_models::ErrorKind;
use dolphin_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Media error ({kind}): {source}")]
    Media {
        kind: ErrorKind,
        #[source]
        source: MediaError,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind}: {message}")]
    Stage { kind: ErrorKind, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Stage {
            kind: ErrorKind::TransientIo,
            message: message.into(),
        }
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Stage {
            kind: ErrorKind::AdapterFailure,
            message: message.into(),
        }
    }

    pub fn asset_missing(message: impl Into<String>) -> Self {
        Self::Stage {
            kind: ErrorKind::AssetMissing,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Stage {
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Media { kind, .. } | WorkerError::Stage { kind, .. } => *kind,
            WorkerError::Queue(QueueError::Validation(_)) => ErrorKind::Validation,
            WorkerError::Queue(_) | WorkerError::Io(_) => ErrorKind::TransientIo,
            // Retrying with the same deployment cannot fix configuration.
            WorkerError::Config(_) => ErrorKind::AssetMissing,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The worker lost ownership of the job mid-attempt.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, WorkerError::Queue(e) if e.is_lease_lost())
    }

    /// Reason stored on the job. Never contains paths or tool output.
    pub fn public_reason(&self) -> &'static str {
        self.kind().public_reason()
    }
}

fn classify_media(error: &MediaError) -> ErrorKind {
    match error {
        MediaError::AssetMissing(_) | MediaError::Config(_) => ErrorKind::AssetMissing,
        MediaError::Io(_) | MediaError::Timeout(_) | MediaError::FileNotFound(_) => {
            ErrorKind::TransientIo
        }
        MediaError::ToolNotFound(_)
        | MediaError::ToolFailed { .. }
        | MediaError::SynthesisFailed { .. }
        | MediaError::InvalidMedia(_)
        | MediaError::Json(_)
        | MediaError::Image(_) => ErrorKind::AdapterFailure,
    }
}

impl From<MediaError> for WorkerError {
    fn from(source: MediaError) -> Self {
        Self::Media {
            kind: classify_media(&source),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dolphin_models::JobId;
    use std::path::PathBuf;

    #[test]
    fn test_media_errors_classified_structurally() {
        let missing: WorkerError = MediaError::AssetMissing(PathBuf::from("/assets/intro.mp4")).into();
        assert_eq!(missing.kind(), ErrorKind::AssetMissing);
        assert!(!missing.is_retryable());

        let failed: WorkerError = MediaError::ffmpeg_failed("exit 1", None, Some(1)).into();
        assert_eq!(failed.kind(), ErrorKind::AdapterFailure);
        assert!(failed.is_retryable());

        let timeout: WorkerError = MediaError::Timeout(600).into();
        assert_eq!(timeout.kind(), ErrorKind::TransientIo);

        let no_key: WorkerError = MediaError::config("AZURE_SPEECH_KEY is not set").into();
        assert_eq!(no_key.kind(), ErrorKind::AssetMissing);
    }

    #[test]
    fn test_message_text_does_not_affect_kind() {
        // A message mentioning "not found" is still an adapter failure.
        let err: WorkerError = MediaError::synthesis_failed("voice not found", Some(404)).into();
        assert_eq!(err.kind(), ErrorKind::AdapterFailure);
    }

    #[test]
    fn test_public_reason_hides_detail() {
        let err: WorkerError = MediaError::AssetMissing(PathBuf::from("/srv/templates/template_ar.png")).into();
        assert!(!err.public_reason().contains("/srv"));
        assert!(err.to_string().contains("template_ar.png"));
    }

    #[test]
    fn test_lease_lost_detection() {
        let err = WorkerError::from(QueueError::LeaseLost(JobId::new()));
        assert!(err.is_lease_lost());
        assert_eq!(err.kind(), ErrorKind::TransientIo);
        assert!(!WorkerError::transient("disk busy").is_lease_lost());
    }
}
