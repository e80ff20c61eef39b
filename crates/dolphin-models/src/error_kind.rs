//! Failure taxonomy shared by the executor and the store.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a stage failure, fixed where the error is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Filesystem contention, adapter timeouts, lost workers
    TransientIo,
    /// Synthesis or transform process failed
    AdapterFailure,
    /// Template, font or source clip absent
    AssetMissing,
    /// Payload should have been rejected upstream
    Validation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::AdapterFailure => "adapter_failure",
            ErrorKind::AssetMissing => "asset_missing",
            ErrorKind::Validation => "validation",
        }
    }

    /// Only transient and adapter failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo | ErrorKind::AdapterFailure)
    }

    /// Opaque, user-facing reason stored on a failed job.
    pub fn public_reason(&self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "A temporary storage or network problem interrupted processing.",
            ErrorKind::AdapterFailure => "Media processing failed.",
            ErrorKind::AssetMissing => "A required template or media asset is unavailable.",
            ErrorKind::Validation => "The request could not be processed.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TransientIo.is_retryable());
        assert!(ErrorKind::AdapterFailure.is_retryable());
        assert!(!ErrorKind::AssetMissing.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
    }

    #[test]
    fn test_public_reason_has_no_paths() {
        for kind in [
            ErrorKind::TransientIo,
            ErrorKind::AdapterFailure,
            ErrorKind::AssetMissing,
            ErrorKind::Validation,
        ] {
            assert!(!kind.public_reason().contains('/'));
        }
    }
}
