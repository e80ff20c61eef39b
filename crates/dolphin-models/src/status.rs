//! Read-only job status projection for polling clients.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobKind, JobRecord, JobResult, JobState};

/// Snapshot of a job as seen by a polling consumer.
///
/// `result` is only present for completed jobs and `failure_reason` only for
/// failed ones. The reason is an opaque sentence without paths or traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusView {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    /// Progress percentage (0-100)
    pub progress: u8,
    pub attempt: u32,
    pub stage_log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobRecord> for JobStatusView {
    fn from(record: JobRecord) -> Self {
        let result = match record.state {
            JobState::Completed => record.result,
            _ => None,
        };
        let failure_reason = match record.state {
            JobState::Failed => record.failure_reason,
            _ => None,
        };

        Self {
            id: record.id,
            kind: record.kind,
            state: record.state,
            progress: record.progress.min(100),
            attempt: record.attempt,
            stage_log: record.stage_log,
            result,
            failure_reason,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl JobStatusView {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
