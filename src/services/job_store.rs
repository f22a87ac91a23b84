//! Durable job and image records.
//!
//! The store owns every job state transition. Worker-side mutations are
//! conditional on the caller still holding the job's lease and the job still
//! being `running`, which is what makes a job single-writer after its claim.
//! Image reference counts move in the same step as the job transition that
//! changes them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::to_delta;
use crate::models::image::{ImageRef, StoredImage};
use crate::models::job::{Job, JobError, JobErrorCode, JobId, JobState, NewJob, RetryCause};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_image(&self, image: StoredImage) -> Result<(), StoreError>;
    async fn get_image(&self, image_ref: &ImageRef) -> Result<Option<StoredImage>, StoreError>;
    /// Unreferenced images past their expiry, oldest first.
    async fn expired_images(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredImage>, StoreError>;
    /// Delete image metadata if it is still unreferenced and expired.
    async fn delete_expired_image(
        &self,
        image_ref: &ImageRef,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Create a queued job, taking a reference on its image.
    async fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;
    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    /// Claim the highest-priority, oldest job that is due.
    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;
    /// Claim one specific job. Exactly one concurrent caller gets `Some`.
    async fn claim(
        &self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;
    /// Extend the lease. `false` once the worker no longer owns a running job.
    async fn heartbeat(
        &self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn complete(
        &self,
        id: &JobId,
        worker: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    async fn fail(
        &self,
        id: &JobId,
        worker: &str,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    /// Put a running job back in the queue, claimable from `available_at`,
    /// charging the failure to the budget for `cause`.
    async fn requeue(
        &self,
        id: &JobId,
        worker: &str,
        available_at: DateTime<Utc>,
        cause: RetryCause,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    async fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError>;
    /// Called by the worker of a job cancelled mid-run once it has let go of
    /// its resources. Drops the lease and the image reference.
    async fn acknowledge_cancel(
        &self,
        id: &JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn queue_depth(&self) -> Result<usize, StoreError>;
    /// Recover jobs whose worker stopped heartbeating. A job fails once it
    /// has lost `max_lease_losses` leases.
    async fn requeue_expired_leases(
        &self,
        max_lease_losses: u32,
        now: DateTime<Utc>,
    ) -> Result<LeaseRecovery, StoreError>;
    /// Delete terminal jobs last updated before `cutoff`.
    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError>;
    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The job is now cancelled. A running job releases its models at the
    /// worker's next safe point.
    Cancelled { job: Job, was_running: bool },
    AlreadyTerminal(JobState),
}

/// What a lease sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRecovery {
    pub requeued: usize,
    pub failed: usize,
    /// Cancelled jobs whose worker vanished before acknowledging.
    pub released: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("image not found: {0}")]
    ImageNotFound(ImageRef),

    #[error("image expired: {0}")]
    ImageExpired(ImageRef),

    #[error("image already stored: {0}")]
    DuplicateImage(ImageRef),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("worker {worker} does not hold the lease on job {id}")]
    LeaseLost { id: JobId, worker: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// The job was cancelled while the caller was working on it.
    pub fn is_cancelled_underneath(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition {
                from: JobState::Cancelled,
                ..
            }
        )
    }
}

/// Error recorded on jobs whose worker vanished too many times.
pub fn worker_lost_error(lease_losses: u32) -> JobError {
    JobError::new(
        JobErrorCode::WorkerLost,
        format!("worker lease expired {lease_losses} times"),
    )
}

/// Process-local store. Not durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    images: HashMap<ImageRef, StoredImage>,
    next_seq: u64,
}

impl MemoryState {
    fn release_image(&mut self, image_ref: &ImageRef) {
        if let Some(image) = self.images.get_mut(image_ref) {
            image.ref_count = image.ref_count.saturating_sub(1);
        }
    }

    fn claim_job(
        &mut self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let job = self.jobs.get_mut(id)?;
        if job.state != JobState::Queued || job.available_at > now {
            return None;
        }
        job.state = JobState::Running;
        job.attempts += 1;
        job.lease_owner = Some(worker.to_string());
        job.lease_expires_at = Some(now + to_delta(lease_ttl));
        job.updated_at = now;
        Some(job.clone())
    }

    /// Move a job this worker is running to `to`.
    fn finish(
        &mut self,
        id: &JobId,
        worker: &str,
        to: JobState,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut Job),
    ) -> Result<Job, StoreError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        if !job.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: job.state,
                to,
            });
        }
        if job.lease_owner.as_deref() != Some(worker) {
            return Err(StoreError::LeaseLost {
                id: id.clone(),
                worker: worker.to_string(),
            });
        }

        job.state = to;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        apply(job);

        let job = job.clone();
        if to.is_terminal() {
            self.release_image(&job.payload_ref);
        }
        Ok(job)
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_image(&self, image: StoredImage) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.images.contains_key(&image.image_ref) {
            return Err(StoreError::DuplicateImage(image.image_ref));
        }
        state.images.insert(image.image_ref.clone(), image);
        Ok(())
    }

    async fn get_image(&self, image_ref: &ImageRef) -> Result<Option<StoredImage>, StoreError> {
        Ok(self.lock().images.get(image_ref).cloned())
    }

    async fn expired_images(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredImage>, StoreError> {
        let state = self.lock();
        let mut expired: Vec<_> = state
            .images
            .values()
            .filter(|image| image.is_deletable(now))
            .cloned()
            .collect();
        expired.sort_by_key(|image| image.expires_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn delete_expired_image(
        &self,
        image_ref: &ImageRef,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let deletable = state
            .images
            .get(image_ref)
            .is_some_and(|image| image.is_deletable(now));
        if deletable {
            state.images.remove(image_ref);
        }
        Ok(deletable)
    }

    async fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut state = self.lock();

        let image = state
            .images
            .get_mut(&new_job.payload_ref)
            .ok_or_else(|| StoreError::ImageNotFound(new_job.payload_ref.clone()))?;
        if image.expires_at <= now {
            return Err(StoreError::ImageExpired(new_job.payload_ref));
        }
        image.ref_count += 1;

        state.next_seq += 1;
        let job = Job {
            id: JobId::generate(),
            kind: new_job.kind,
            state: JobState::Queued,
            payload_ref: new_job.payload_ref,
            options: new_job.options,
            priority: new_job.priority,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            attempts: 0,
            transient_failures: 0,
            resource_failures: 0,
            lease_losses: 0,
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            seq: state.next_seq,
        };
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock();
        let next = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued && job.available_at <= now)
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|job| job.id.clone());

        Ok(next.and_then(|id| state.claim_job(&id, worker, lease_ttl, now)))
    }

    async fn claim(
        &self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.lock();
        if !state.jobs.contains_key(id) {
            return Err(StoreError::JobNotFound(id.clone()));
        }
        Ok(state.claim_job(id, worker, lease_ttl, now))
    }

    async fn heartbeat(
        &self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.jobs.get_mut(id) {
            Some(job)
                if job.state == JobState::Running && job.lease_owner.as_deref() == Some(worker) =>
            {
                job.lease_expires_at = Some(now + to_delta(lease_ttl));
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::JobNotFound(id.clone())),
        }
    }

    async fn complete(
        &self,
        id: &JobId,
        worker: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.lock()
            .finish(id, worker, JobState::Completed, now, |job| {
                job.result = Some(result);
                job.error = None;
            })
    }

    async fn fail(
        &self,
        id: &JobId,
        worker: &str,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.lock().finish(id, worker, JobState::Failed, now, |job| {
            job.result = None;
            job.error = Some(error);
        })
    }

    async fn requeue(
        &self,
        id: &JobId,
        worker: &str,
        available_at: DateTime<Utc>,
        cause: RetryCause,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.lock().finish(id, worker, JobState::Queued, now, |job| {
            job.available_at = available_at;
            match cause {
                RetryCause::Transient => job.transient_failures += 1,
                RetryCause::ResourceExhausted => job.resource_failures += 1,
            }
        })
    }

    async fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        if !job.state.can_transition_to(JobState::Cancelled) {
            return Ok(CancelOutcome::AlreadyTerminal(job.state));
        }
        let was_running = job.state == JobState::Running;

        job.state = JobState::Cancelled;
        job.updated_at = now;
        let job = job.clone();
        // A running job keeps its lease, and with it the image, until the
        // worker acknowledges.
        if !was_running {
            state.release_image(&job.payload_ref);
        }
        Ok(CancelOutcome::Cancelled { job, was_running })
    }

    async fn acknowledge_cancel(
        &self,
        id: &JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return Err(StoreError::JobNotFound(id.clone()));
        };
        if job.state != JobState::Cancelled || job.lease_owner.as_deref() != Some(worker) {
            return Ok(false);
        }
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        let payload_ref = job.payload_ref.clone();
        state.release_image(&payload_ref);
        Ok(true)
    }

    async fn queue_depth(&self) -> Result<usize, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .count())
    }

    async fn requeue_expired_leases(
        &self,
        max_lease_losses: u32,
        now: DateTime<Utc>,
    ) -> Result<LeaseRecovery, StoreError> {
        let mut state = self.lock();
        let mut recovery = LeaseRecovery::default();
        let mut released_images = Vec::new();

        for job in state.jobs.values_mut() {
            let expired = job.lease_owner.is_some()
                && job.lease_expires_at.is_some_and(|expires| expires < now);
            if !expired {
                continue;
            }

            job.lease_owner = None;
            job.lease_expires_at = None;
            job.updated_at = now;

            if job.state == JobState::Running {
                job.lease_losses += 1;
            }
            match job.state {
                JobState::Running if job.lease_losses >= max_lease_losses => {
                    job.state = JobState::Failed;
                    job.error = Some(worker_lost_error(job.lease_losses));
                    released_images.push(job.payload_ref.clone());
                    recovery.failed += 1;
                }
                JobState::Running => {
                    job.state = JobState::Queued;
                    job.available_at = now;
                    recovery.requeued += 1;
                }
                JobState::Cancelled => {
                    released_images.push(job.payload_ref.clone());
                    recovery.released += 1;
                }
                _ => {}
            }
        }

        for image_ref in released_images {
            state.release_image(&image_ref);
        }
        Ok(recovery)
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let doomed: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.state.is_terminal() && !job.holds_image() && job.updated_at < cutoff)
            .take(limit)
            .map(|job| job.id.clone())
            .collect();

        for id in &doomed {
            state.jobs.remove(id);
        }
        Ok(doomed.len())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
