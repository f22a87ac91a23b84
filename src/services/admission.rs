use garde::Validate;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::clock::Clock;
use crate::models::api::SubmitJobRequest;
use crate::models::image::ImageRef;
use crate::models::job::{Job, JobId, JobState, NewJob, DEFAULT_PRIORITY};
use crate::services::breaker::{BreakerState, CircuitBreaker, Rejection};
use crate::services::job_store::{CancelOutcome, JobStore, StoreError};

/// Front door for new work: validates, applies backpressure, enqueues and
/// wakes an idle worker.
pub struct AdmissionGateway {
    store: Arc<dyn JobStore>,
    breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
    wakeup: Arc<Notify>,
    /// Serializes the depth check with the insert so a burst cannot
    /// overshoot the queue ceiling.
    admission: Mutex<()>,
}

impl AdmissionGateway {
    pub fn new(
        store: Arc<dyn JobStore>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
        wakeup: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            breaker,
            clock,
            wakeup,
            admission: Mutex::new(()),
        }
    }

    pub async fn submit(&self, request: SubmitJobRequest) -> Result<Job, AdmissionError> {
        request
            .validate()
            .map_err(|report| AdmissionError::Validation(report.to_string()))?;

        let admission_guard = self.admission.lock().await;
        let depth = self.store.queue_depth().await?;
        if let Err(rejection) = self.breaker.admit(depth) {
            tracing::warn!(queue_depth = depth, reason = %rejection, "Submission rejected");
            return Err(AdmissionError::Overloaded(rejection));
        }

        let new_job = NewJob {
            kind: request.kind,
            payload_ref: ImageRef::from(request.image_ref),
            options: request.options,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
        };

        let job = match self.store.create(new_job, self.clock.now()).await {
            Ok(job) => job,
            Err(StoreError::ImageNotFound(image_ref)) => {
                return Err(AdmissionError::Validation(format!(
                    "image_ref {image_ref} does not exist"
                )))
            }
            Err(StoreError::ImageExpired(image_ref)) => {
                return Err(AdmissionError::Validation(format!(
                    "image_ref {image_ref} has expired"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        drop(admission_guard);

        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            priority = job.priority,
            "Job queued"
        );
        metrics::counter!("jobs_submitted_total", "kind" => job.kind.to_string()).increment(1);
        self.wakeup.notify_one();
        Ok(job)
    }

    pub async fn status(&self, id: &JobId) -> Result<Job, AdmissionError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(id.clone()))
    }

    /// Cancel a queued or running job. A running job lets go of its models
    /// at the worker's next safe point.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, AdmissionError> {
        match self.store.cancel(id, self.clock.now()).await {
            Ok(CancelOutcome::Cancelled { job, was_running }) => {
                tracing::info!(job_id = %id, was_running, "Job cancelled");
                metrics::counter!("jobs_cancelled_total").increment(1);
                // A running job hands its slot back once the worker lets go.
                if !was_running {
                    self.breaker.release_slot();
                }
                Ok(job)
            }
            Ok(CancelOutcome::AlreadyTerminal(state)) => Err(AdmissionError::Conflict {
                id: id.clone(),
                state,
            }),
            Err(StoreError::JobNotFound(id)) => Err(AdmissionError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn queue_depth(&self) -> Result<usize, AdmissionError> {
        Ok(self.store.queue_depth().await?)
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("service overloaded: {0}")]
    Overloaded(Rejection),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {id} is already {state}")]
    Conflict { id: JobId, state: JobState },

    #[error(transparent)]
    Store(#[from] StoreError),
}
