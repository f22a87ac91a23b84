use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::image::ImageRef;

/// Default scheduling priority. Higher values are claimed first.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Opaque job identifier handed back to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of analysis a job requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    PestDetection,
    DiseaseDetection,
    /// Pest detection and disease diagnosis on the same image.
    Comprehensive,
}

/// Lifecycle state of an inference job.
///
/// ```text
/// queued -> running -> completed | failed
/// queued | running -> cancelled
/// running -> queued            (retry or expired lease)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// Machine-readable failure category recorded on failed jobs and API errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobErrorCode {
    ValidationError,
    ResourceExhausted,
    TransientError,
    PermanentError,
    ServiceOverloaded,
    /// The worker holding the job stopped renewing its lease too many times.
    WorkerLost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A queued inference request and everything the scheduler knows about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub payload_ref: ImageRef,
    pub options: serde_json::Value,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    /// Executions started so far, including the current one.
    pub attempts: u32,
    /// Retries charged to transient or unclassified failures.
    pub transient_failures: u32,
    /// Retries charged to waiting on VRAM.
    pub resource_failures: u32,
    /// Times a worker vanished while holding the job.
    pub lease_losses: u32,
    /// Earliest time the job may be claimed again.
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Submission order, used as the FIFO tie-break within a priority.
    pub seq: u64,
}

impl Job {
    /// Failures already charged to the budget for `cause`.
    pub fn failures(&self, cause: RetryCause) -> u32 {
        match cause {
            RetryCause::Transient => self.transient_failures,
            RetryCause::ResourceExhausted => self.resource_failures,
        }
    }

    /// A cancelled job still owned by a worker keeps its image referenced
    /// until that worker reaches a safe point and lets go.
    pub fn holds_image(&self) -> bool {
        !self.state.is_terminal() || (self.state == JobState::Cancelled && self.lease_owner.is_some())
    }
}

/// Which retry budget a requeued attempt is charged to. Each budget is
/// counted separately so that one kind of trouble cannot use up another's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RetryCause {
    Transient,
    ResourceExhausted,
}

/// Fields supplied when a job is created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload_ref: ImageRef,
    pub options: serde_json::Value,
    pub priority: i32,
}
