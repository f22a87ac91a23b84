use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;

use crate::clock::to_delta;
use crate::models::image::{ImageRef, StoredImage};
use crate::models::job::{
    Job, JobError, JobErrorCode, JobId, JobKind, JobState, NewJob, RetryCause,
};
use crate::services::job_store::{CancelOutcome, JobStore, LeaseRecovery, StoreError};

const JOB_COLUMNS: &str = "id, seq, kind, state, payload_ref, options, priority, created_at, \
     updated_at, result, error_code, error_message, attempts, transient_failures, \
     resource_failures, lease_losses, available_at, lease_owner, lease_expires_at";

const IMAGE_COLUMNS: &str =
    "image_ref, bytes_ref, mime_type, size_bytes, encrypted, stored_at, expires_at, ref_count";

/// PostgreSQL-backed job store. Claims use `FOR UPDATE SKIP LOCKED` so any
/// number of workers (or processes) can share one queue.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn job_exists(&self, id: &JobId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS found FROM inference_jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Move a running job owned by `worker` out of `running`.
    async fn finish(
        &self,
        id: &JobId,
        worker: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let to = outcome.target();
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT state, lease_owner FROM inference_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        let from = parse_state(&current.try_get::<String, _>("state")?)?;
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        let owner: Option<String> = current.try_get("lease_owner")?;
        if owner.as_deref() != Some(worker) {
            return Err(StoreError::LeaseLost {
                id: id.clone(),
                worker: worker.to_string(),
            });
        }

        let set_clause = match outcome {
            Outcome::Completed(_) => {
                "result = $4, error_code = NULL, error_message = NULL".to_string()
            }
            Outcome::Failed(_) => "result = NULL, error_code = $4, error_message = $5".to_string(),
            Outcome::Requeued(_, cause) => {
                let column = failure_column(cause);
                format!("available_at = $4, {column} = {column} + 1")
            }
        };
        let sql = format!(
            "UPDATE inference_jobs \
             SET state = $2, updated_at = $3, lease_owner = NULL, lease_expires_at = NULL, \
                 {set_clause} \
             WHERE id = $1 \
             RETURNING {JOB_COLUMNS}"
        );
        let query = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(to.to_string())
            .bind(now);
        let query = match outcome {
            Outcome::Completed(result) => query.bind(result),
            Outcome::Failed(error) => query.bind(error.code.to_string()).bind(error.message),
            Outcome::Requeued(available_at, _) => query.bind(available_at),
        };
        let row = query.fetch_one(&mut *tx).await?;
        let job = job_from_row(&row)?;

        if to.is_terminal() {
            release_image(&mut tx, &job.payload_ref).await?;
        }
        tx.commit().await?;
        Ok(job)
    }
}

/// How a running job leaves `running`.
enum Outcome {
    Completed(serde_json::Value),
    Failed(JobError),
    Requeued(DateTime<Utc>, RetryCause),
}

impl Outcome {
    fn target(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
            Self::Requeued(..) => JobState::Queued,
        }
    }
}

fn failure_column(cause: RetryCause) -> &'static str {
    match cause {
        RetryCause::Transient => "transient_failures",
        RetryCause::ResourceExhausted => "resource_failures",
    }
}

async fn release_image(
    tx: &mut Transaction<'_, Postgres>,
    image_ref: &ImageRef,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE stored_images SET ref_count = GREATEST(ref_count - 1, 0) WHERE image_ref = $1",
    )
    .bind(image_ref.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_state(value: &str) -> Result<JobState, StoreError> {
    JobState::from_str(value).map_err(|_| StoreError::Corrupt(format!("unknown job state {value}")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = JobKind::from_str(&kind)
        .map_err(|_| StoreError::Corrupt(format!("unknown job kind {kind}")))?;
    let state = parse_state(&row.try_get::<String, _>("state")?)?;

    let error_code: Option<String> = row.try_get("error_code")?;
    let error = match error_code {
        Some(code) => Some(JobError {
            code: JobErrorCode::from_str(&code)
                .map_err(|_| StoreError::Corrupt(format!("unknown error code {code}")))?,
            message: row.try_get::<Option<String>, _>("error_message")?.unwrap_or_default(),
        }),
        None => None,
    };

    let seq: i64 = row.try_get("seq")?;

    Ok(Job {
        id: JobId::from(row.try_get::<String, _>("id")?),
        kind,
        state,
        payload_ref: ImageRef::from(row.try_get::<String, _>("payload_ref")?),
        options: row.try_get("options")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        result: row.try_get("result")?,
        error,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        transient_failures: to_u32(row.try_get("transient_failures")?, "transient_failures")?,
        resource_failures: to_u32(row.try_get("resource_failures")?, "resource_failures")?,
        lease_losses: to_u32(row.try_get("lease_losses")?, "lease_losses")?,
        available_at: row.try_get("available_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        seq: seq as u64,
    })
}

fn image_from_row(row: &PgRow) -> Result<StoredImage, StoreError> {
    let size_bytes: i64 = row.try_get("size_bytes")?;
    Ok(StoredImage {
        image_ref: ImageRef::from(row.try_get::<String, _>("image_ref")?),
        bytes_ref: row.try_get("bytes_ref")?,
        mime_type: row.try_get("mime_type")?,
        size_bytes: size_bytes as u64,
        encrypted: row.try_get("encrypted")?,
        stored_at: row.try_get("stored_at")?,
        expires_at: row.try_get("expires_at")?,
        ref_count: to_u32(row.try_get("ref_count")?, "ref_count")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_image(&self, image: StoredImage) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stored_images
                (image_ref, bytes_ref, mime_type, size_bytes, encrypted, stored_at, expires_at, ref_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (image_ref) DO NOTHING
            "#,
        )
        .bind(image.image_ref.as_str())
        .bind(&image.bytes_ref)
        .bind(&image.mime_type)
        .bind(image.size_bytes as i64)
        .bind(image.encrypted)
        .bind(image.stored_at)
        .bind(image.expires_at)
        .bind(image.ref_count as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateImage(image.image_ref));
        }
        Ok(())
    }

    async fn get_image(&self, image_ref: &ImageRef) -> Result<Option<StoredImage>, StoreError> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM stored_images WHERE image_ref = $1");
        let row = sqlx::query(&sql)
            .bind(image_ref.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(image_from_row).transpose()
    }

    async fn expired_images(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredImage>, StoreError> {
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM stored_images \
             WHERE ref_count = 0 AND expires_at < $1 \
             ORDER BY expires_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(image_from_row).collect()
    }

    async fn delete_expired_image(
        &self,
        image_ref: &ImageRef,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM stored_images WHERE image_ref = $1 AND ref_count = 0 AND expires_at < $2",
        )
        .bind(image_ref.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let referenced = sqlx::query(
            r#"
            UPDATE stored_images
            SET ref_count = ref_count + 1
            WHERE image_ref = $1 AND expires_at > $2
            RETURNING image_ref
            "#,
        )
        .bind(new_job.payload_ref.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if referenced.is_none() {
            let exists = sqlx::query("SELECT 1 AS found FROM stored_images WHERE image_ref = $1")
                .bind(new_job.payload_ref.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            return Err(if exists {
                StoreError::ImageExpired(new_job.payload_ref)
            } else {
                StoreError::ImageNotFound(new_job.payload_ref)
            });
        }

        let sql = format!(
            "INSERT INTO inference_jobs \
                 (id, kind, state, payload_ref, options, priority, created_at, updated_at, \
                  attempts, available_at) \
             VALUES ($1, $2, 'queued', $3, $4, $5, $6, $6, 0, $6) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(JobId::generate().as_str())
            .bind(new_job.kind.to_string())
            .bind(new_job.payload_ref.as_str())
            .bind(&new_job.options)
            .bind(new_job.priority)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        let job = job_from_row(&row)?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM inference_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE inference_jobs \
             SET state = 'running', attempts = attempts + 1, lease_owner = $1, \
                 lease_expires_at = $2, updated_at = $3 \
             WHERE id = ( \
                 SELECT id FROM inference_jobs \
                 WHERE state = 'queued' AND available_at <= $3 \
                 ORDER BY priority DESC, seq ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(worker)
            .bind(now + to_delta(lease_ttl))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim(
        &self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "UPDATE inference_jobs \
             SET state = 'running', attempts = attempts + 1, lease_owner = $2, \
                 lease_expires_at = $3, updated_at = $4 \
             WHERE id = $1 AND state = 'queued' AND available_at <= $4 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(worker)
            .bind(now + to_delta(lease_ttl))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None if self.job_exists(id).await? => Ok(None),
            None => Err(StoreError::JobNotFound(id.clone())),
        }
    }

    async fn heartbeat(
        &self,
        id: &JobId,
        worker: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE inference_jobs
            SET lease_expires_at = $3
            WHERE id = $1 AND state = 'running' AND lease_owner = $2
            "#,
        )
        .bind(id.as_str())
        .bind(worker)
        .bind(now + to_delta(lease_ttl))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.job_exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::JobNotFound(id.clone()))
        }
    }

    async fn complete(
        &self,
        id: &JobId,
        worker: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.finish(id, worker, Outcome::Completed(result), now).await
    }

    async fn fail(
        &self,
        id: &JobId,
        worker: &str,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.finish(id, worker, Outcome::Failed(error), now).await
    }

    async fn requeue(
        &self,
        id: &JobId,
        worker: &str,
        available_at: DateTime<Utc>,
        cause: RetryCause,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        self.finish(id, worker, Outcome::Requeued(available_at, cause), now)
            .await
    }

    async fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<CancelOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query("SELECT state FROM inference_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;

        let from = parse_state(&current.try_get::<String, _>("state")?)?;
        if !from.can_transition_to(JobState::Cancelled) {
            return Ok(CancelOutcome::AlreadyTerminal(from));
        }
        let was_running = from == JobState::Running;

        let sql = format!(
            "UPDATE inference_jobs SET state = 'cancelled', updated_at = $2 \
             WHERE id = $1 \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let job = job_from_row(&row)?;

        // A running job keeps its lease, and with it the image, until the
        // worker acknowledges.
        if !was_running {
            release_image(&mut tx, &job.payload_ref).await?;
        }
        tx.commit().await?;
        Ok(CancelOutcome::Cancelled { job, was_running })
    }

    async fn acknowledge_cancel(
        &self,
        id: &JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let released = sqlx::query(
            r#"
            UPDATE inference_jobs
            SET lease_owner = NULL, lease_expires_at = NULL, updated_at = $3
            WHERE id = $1 AND state = 'cancelled' AND lease_owner = $2
            RETURNING payload_ref
            "#,
        )
        .bind(id.as_str())
        .bind(worker)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = released else {
            drop(tx);
            return if self.job_exists(id).await? {
                Ok(false)
            } else {
                Err(StoreError::JobNotFound(id.clone()))
            };
        };

        let payload_ref = ImageRef::from(row.try_get::<String, _>("payload_ref")?);
        release_image(&mut tx, &payload_ref).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn queue_depth(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM inference_jobs WHERE state = 'queued'")
            .fetch_one(&self.pool)
            .await?;
        let depth: i64 = row.try_get("depth")?;
        Ok(depth as usize)
    }

    async fn requeue_expired_leases(
        &self,
        max_lease_losses: u32,
        now: DateTime<Utc>,
    ) -> Result<LeaseRecovery, StoreError> {
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            r#"
            UPDATE inference_jobs
            SET state = 'failed',
                error_code = 'worker_lost',
                error_message = 'worker lease expired ' || (lease_losses + 1) || ' times',
                lease_losses = lease_losses + 1,
                result = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $2
            WHERE state = 'running' AND lease_expires_at < $2 AND lease_losses + 1 >= $1
            RETURNING payload_ref
            "#,
        )
        .bind(max_lease_losses as i32)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let requeued = sqlx::query(
            r#"
            UPDATE inference_jobs
            SET state = 'queued',
                available_at = $1,
                lease_losses = lease_losses + 1,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = $1
            WHERE state = 'running' AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let released = sqlx::query(
            r#"
            UPDATE inference_jobs
            SET lease_owner = NULL, lease_expires_at = NULL, updated_at = $1
            WHERE state = 'cancelled' AND lease_owner IS NOT NULL AND lease_expires_at < $1
            RETURNING payload_ref
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for row in failed.iter().chain(released.iter()) {
            let payload_ref = ImageRef::from(row.try_get::<String, _>("payload_ref")?);
            release_image(&mut tx, &payload_ref).await?;
        }
        tx.commit().await?;

        Ok(LeaseRecovery {
            requeued: requeued.rows_affected() as usize,
            failed: failed.len(),
            released: released.len(),
        })
    }

    async fn purge_terminal_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM inference_jobs
            WHERE id IN (
                SELECT id FROM inference_jobs
                WHERE state IN ('completed', 'failed', 'cancelled')
                  AND lease_owner IS NULL
                  AND updated_at < $1
                ORDER BY updated_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
