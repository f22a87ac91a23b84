//! Worker pool: a fixed set of tokio tasks that claim jobs from the store,
//! run them through the executor and persist the outcome, plus a reaper that
//! recovers jobs whose worker stopped heartbeating.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::clock::{to_delta, Clock};
use crate::models::job::{Job, JobError, JobErrorCode, JobId, JobState, RetryCause};
use crate::services::breaker::CircuitBreaker;
use crate::services::executor::{CancellationProbe, ExecutionError, InferenceExecutor};
use crate::services::job_store::{JobStore, StoreError};

/// How failed attempts are retried. Every budget counts only failures of
/// its own class.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts allowed for transient failures. Also the number of lost
    /// leases a job survives.
    pub max_attempts: u32,
    /// Attempts allowed when the failure could not be classified.
    pub unclassified_max_attempts: u32,
    /// Attempts allowed while waiting for VRAM to free up.
    pub resource_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            unclassified_max_attempts: 2,
            resource_max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` has just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// The budget a failure is charged to and how many failures of that
    /// class a job may see before it fails for good. `None` means never retry.
    /// Unclassified failures share the transient counter under a tighter cap.
    pub fn budget(&self, error: &ExecutionError) -> Option<(RetryCause, u32)> {
        match error {
            ExecutionError::Transient(_) => Some((RetryCause::Transient, self.max_attempts)),
            ExecutionError::Unclassified(_) => {
                Some((RetryCause::Transient, self.unclassified_max_attempts))
            }
            ExecutionError::ResourceExhausted(_) => {
                Some((RetryCause::ResourceExhausted, self.resource_max_attempts))
            }
            ExecutionError::Permanent(_) | ExecutionError::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            lease_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(15),
        }
    }
}

/// Everything a worker needs. Shared by all workers of a pool.
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<InferenceExecutor>,
    pub breaker: Arc<CircuitBreaker>,
    pub clock: Arc<dyn Clock>,
    pub wakeup: Arc<Notify>,
    pub retry: RetryPolicy,
    pub config: PoolConfig,
}

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn the workers and the lease reaper.
    pub fn start(context: WorkerContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        let busy = Arc::new(AtomicUsize::new(0));
        let workers = context.config.workers;
        let context = Arc::new(context);

        let mut handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|index| {
                let worker = Worker {
                    id: format!("worker-{index}"),
                    context: Arc::clone(&context),
                    busy: Arc::clone(&busy),
                };
                tokio::spawn(worker.run(shutdown.subscribe()))
            })
            .collect();
        handles.push(tokio::spawn(reap_expired_leases(
            Arc::clone(&context),
            shutdown.subscribe(),
        )));

        tracing::info!(workers, "Worker pool started");
        Self {
            shutdown,
            handles: Mutex::new(handles),
            busy,
        }
    }

    /// Workers currently executing a job.
    pub fn active_workers(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Stop claiming new work and wait for in-progress jobs to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

struct Worker {
    id: String,
    context: Arc<WorkerContext>,
    busy: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, "Worker ready, starting job processing loop");
        let poll_interval = self.context.config.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next_job().await {
                Ok(true) => {
                    tracing::debug!(worker_id = %self.id, "Job processed, checking for next job");
                    continue;
                }
                Ok(false) => tracing::trace!(worker_id = %self.id, "No jobs available, waiting"),
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Error processing job, will retry")
                }
            }

            tokio::select! {
                _ = self.context.wakeup.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim and run one job. Returns `Ok(false)` when nothing was due.
    async fn process_next_job(&self) -> Result<bool, StoreError> {
        let ctx = &self.context;
        let Some(job) = ctx
            .store
            .claim_next(&self.id, ctx.config.lease_ttl, ctx.clock.now())
            .await?
        else {
            return Ok(false);
        };

        tracing::info!(
            job_id = %job.id,
            worker_id = %self.id,
            kind = %job.kind,
            attempt = job.attempts,
            "Processing inference job"
        );

        let active = self.busy.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!("active_workers").set(active as f64);
        let started = Instant::now();

        let heartbeat = self.spawn_heartbeat(job.id.clone());
        let probe = StoreCancellation {
            store: Arc::clone(&ctx.store),
            id: job.id.clone(),
        };
        let outcome = ctx.executor.execute(&job, &probe).await;
        heartbeat.abort();

        let persisted = self.persist_outcome(&job, outcome).await;

        let active = self.busy.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!("active_workers").set(active as f64);
        metrics::histogram!("job_processing_seconds", "kind" => job.kind.to_string())
            .record(started.elapsed().as_secs_f64());

        persisted?;
        Ok(true)
    }

    fn spawn_heartbeat(&self, id: JobId) -> JoinHandle<()> {
        let store = Arc::clone(&self.context.store);
        let clock = Arc::clone(&self.context.clock);
        let ttl = self.context.config.lease_ttl;
        let worker = self.id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(&id, &worker, ttl, clock.now()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => tracing::warn!(job_id = %id, error = %e, "Lease heartbeat failed"),
                }
            }
        })
    }

    async fn persist_outcome(
        &self,
        job: &Job,
        outcome: Result<serde_json::Value, ExecutionError>,
    ) -> Result<(), StoreError> {
        let ctx = &self.context;
        let now = ctx.clock.now();

        let persisted = match outcome {
            Ok(result) => ctx
                .store
                .complete(&job.id, &self.id, result, now)
                .await
                .map(|_| {
                    ctx.breaker.record_outcome(true);
                    metrics::counter!("jobs_completed_total").increment(1);
                    tracing::info!(job_id = %job.id, worker_id = %self.id, "Job completed successfully");
                }),
            Err(ExecutionError::Cancelled) => return self.acknowledge_cancel(job).await,
            Err(error) => self.handle_failure(job, error).await,
        };

        match persisted {
            Err(e) if e.is_cancelled_underneath() => self.acknowledge_cancel(job).await,
            other => other,
        }
    }

    async fn handle_failure(&self, job: &Job, error: ExecutionError) -> Result<(), StoreError> {
        let ctx = &self.context;
        let now = ctx.clock.now();
        let code = error.code().unwrap_or(JobErrorCode::TransientError);

        if matches!(
            error,
            ExecutionError::Transient(_) | ExecutionError::Unclassified(_)
        ) {
            ctx.breaker.record_outcome(false);
        }

        let budget = ctx
            .retry
            .budget(&error)
            .map(|(cause, allowed)| (cause, job.failures(cause) + 1, allowed));
        if let Some((cause, failures, allowed)) = budget.filter(|(_, f, allowed)| f < allowed) {
            let delay = ctx.retry.backoff(failures);
            ctx.store
                .requeue(&job.id, &self.id, now + to_delta(delay), cause, now)
                .await?;
            metrics::counter!("jobs_retried_total", "code" => code.to_string()).increment(1);
            tracing::warn!(
                job_id = %job.id,
                worker_id = %self.id,
                attempt = job.attempts,
                cause = %cause,
                failures,
                max_failures = allowed,
                retry_in_secs = delay.as_secs_f64(),
                error = %error,
                "Job failed, will retry"
            );
            ctx.wakeup.notify_one();
            return Ok(());
        }

        let message = match budget {
            Some((_, failures, _)) => format!("failed after {failures} attempts: {error}"),
            None => error.to_string(),
        };
        ctx.store
            .fail(&job.id, &self.id, JobError::new(code, message), now)
            .await?;
        // Bad input and VRAM pressure say nothing about the vision service.
        if !matches!(
            error,
            ExecutionError::Transient(_) | ExecutionError::Unclassified(_)
        ) {
            ctx.breaker.release_slot();
        }
        metrics::counter!("jobs_failed_total", "code" => code.to_string()).increment(1);
        tracing::error!(
            job_id = %job.id,
            worker_id = %self.id,
            code = %code,
            error = %error,
            "Job failed"
        );
        Ok(())
    }

    async fn acknowledge_cancel(&self, job: &Job) -> Result<(), StoreError> {
        let ctx = &self.context;
        if ctx
            .store
            .acknowledge_cancel(&job.id, &self.id, ctx.clock.now())
            .await?
        {
            ctx.breaker.release_slot();
        }
        tracing::info!(job_id = %job.id, worker_id = %self.id, "Cancelled job released");
        Ok(())
    }
}

/// Checks the job's stored state at each safe point.
struct StoreCancellation {
    store: Arc<dyn JobStore>,
    id: JobId,
}

#[async_trait]
impl CancellationProbe for StoreCancellation {
    async fn is_cancelled(&self) -> bool {
        match self.store.get(&self.id).await {
            Ok(Some(job)) => job.state == JobState::Cancelled,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(job_id = %self.id, error = %e, "Cancellation check failed");
                false
            }
        }
    }
}

async fn reap_expired_leases(context: Arc<WorkerContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(context.config.reaper_interval.max(Duration::from_millis(10)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = context.clock.now();
        match context
            .store
            .requeue_expired_leases(context.retry.max_attempts, now)
            .await
        {
            Ok(recovery) => {
                for _ in 0..recovery.failed + recovery.released {
                    context.breaker.release_slot();
                }
                if recovery.requeued + recovery.failed + recovery.released > 0 {
                    tracing::warn!(
                        requeued = recovery.requeued,
                        failed = recovery.failed,
                        released = recovery.released,
                        "Recovered jobs from expired worker leases"
                    );
                }
                if recovery.requeued > 0 {
                    context.wakeup.notify_waiters();
                }
            }
            Err(e) => tracing::error!(error = %e, "Lease reaper failed"),
        }
    }
}
