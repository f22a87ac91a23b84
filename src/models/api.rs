use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::image::ImageRef;
use crate::models::job::{Job, JobError, JobId, JobKind, JobState};
use crate::models::model::ModelStatus;
use crate::services::breaker::BreakerState;
use crate::services::ledger::LedgerSnapshot;

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitJobRequest {
    #[garde(skip)]
    pub kind: JobKind,

    #[garde(length(min = 1, max = 128))]
    pub image_ref: String,

    /// Passed through to the vision service untouched.
    #[serde(default = "empty_options")]
    #[garde(custom(options_must_be_object))]
    pub options: serde_json::Value,

    #[serde(default)]
    #[garde(range(min = -100, max = 100))]
    pub priority: Option<i32>,
}

fn empty_options() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn options_must_be_object(value: &serde_json::Value, _ctx: &()) -> garde::Result {
    if value.is_object() {
        Ok(())
    } else {
        Err(garde::Error::new("options must be a JSON object"))
    }
}

impl SubmitJobRequest {
    pub fn new(kind: JobKind, image_ref: &ImageRef) -> Self {
        Self {
            kind,
            image_ref: image_ref.to_string(),
            options: empty_options(),
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Response after a job is accepted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobState,
}

/// Response for job status polling and cancellation.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.state,
            result: job.result,
            error: job.error,
        }
    }
}

/// Queue and GPU introspection.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue_depth: usize,
    pub active_workers: usize,
    pub breaker_state: BreakerState,
    pub vram: LedgerSnapshot,
    pub models: Vec<ModelStatus>,
}

/// Response after an image upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoreImageResponse {
    pub image_ref: ImageRef,
    pub expires_at: DateTime<Utc>,
}
