use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{to_delta, Clock};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::storage::BlobStore;

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long terminal jobs stay queryable.
    pub job_retention: Duration,
    /// Max images and max jobs removed per sweep.
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            job_retention: Duration::from_secs(86_400),
            batch_size: 500,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub images_deleted: usize,
    /// Images whose metadata is gone but whose blob could not be removed.
    pub blob_failures: usize,
    pub jobs_purged: usize,
    pub duration_ms: u64,
}

/// Removes expired, unreferenced images and old terminal jobs.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            clock,
            config,
        }
    }

    /// Run the sweep every `interval` until `shutdown` flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(self.config.interval.max(Duration::from_millis(10)));
            tracing::info!(interval_secs = self.config.interval.as_secs(), "Retention sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "Retention sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            tracing::info!("Retention sweeper stopped");
        })
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for image in self
            .store
            .expired_images(now, self.config.batch_size)
            .await?
        {
            // The conditional delete loses to any job created since the scan.
            if !self.store.delete_expired_image(&image.image_ref, now).await? {
                continue;
            }
            report.images_deleted += 1;

            if let Err(e) = self.blobs.delete(&image.bytes_ref).await {
                report.blob_failures += 1;
                tracing::warn!(
                    image_ref = %image.image_ref,
                    bytes_ref = %image.bytes_ref,
                    error = %e,
                    "Failed to delete image blob"
                );
            }
        }

        let cutoff = now - to_delta(self.config.job_retention);
        report.jobs_purged = self
            .store
            .purge_terminal_before(cutoff, self.config.batch_size)
            .await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        metrics::counter!("images_expired_total").increment(report.images_deleted as u64);
        metrics::counter!("jobs_purged_total").increment(report.jobs_purged as u64);
        tracing::info!(
            images_deleted = report.images_deleted,
            blob_failures = report.blob_failures,
            jobs_purged = report.jobs_purged,
            duration_ms = report.duration_ms,
            "Retention sweep completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::job::{JobKind, NewJob};
    use crate::services::images::ImageService;
    use crate::services::job_store::InMemoryJobStore;
    use crate::services::storage::InMemoryBlobStore;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];

    #[tokio::test]
    async fn deletes_only_expired_unreferenced_images() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let images = ImageService::new(
            store.clone(),
            blobs.clone(),
            None,
            clock.clone(),
            1024,
            Duration::from_secs(60),
        );
        let orphan = images.store(JPEG).await.unwrap();
        let referenced = images.store(JPEG).await.unwrap();
        store
            .create(
                NewJob {
                    kind: JobKind::PestDetection,
                    payload_ref: referenced.image_ref.clone(),
                    options: serde_json::json!({}),
                    priority: 0,
                },
                clock.now(),
            )
            .await
            .unwrap();

        let sweeper = RetentionSweeper::new(
            store.clone(),
            blobs.clone(),
            clock.clone(),
            RetentionConfig::default(),
        );

        assert_eq!(sweeper.sweep_once().await.unwrap().images_deleted, 0);

        clock.advance(Duration::from_secs(61));
        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report.images_deleted, 1);
        assert_eq!(report.blob_failures, 0);
        assert!(store.get_image(&orphan.image_ref).await.unwrap().is_none());
        assert!(store.get_image(&referenced.image_ref).await.unwrap().is_some());
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn purges_terminal_jobs_after_retention() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let images = ImageService::new(
            store.clone(),
            blobs.clone(),
            None,
            clock.clone(),
            1024,
            Duration::from_secs(3600),
        );
        let image = images.store(JPEG).await.unwrap();
        let job = store
            .create(
                NewJob {
                    kind: JobKind::DiseaseDetection,
                    payload_ref: image.image_ref,
                    options: serde_json::json!({}),
                    priority: 0,
                },
                clock.now(),
            )
            .await
            .unwrap();
        store.cancel(&job.id, clock.now()).await.unwrap();

        let sweeper = RetentionSweeper::new(
            store.clone(),
            blobs,
            clock.clone(),
            RetentionConfig {
                job_retention: Duration::from_secs(600),
                ..RetentionConfig::default()
            },
        );

        assert_eq!(sweeper.sweep_once().await.unwrap().jobs_purged, 0);
        clock.advance(Duration::from_secs(601));
        assert_eq!(sweeper.sweep_once().await.unwrap().jobs_purged, 1);
        assert!(store.get(&job.id).await.unwrap().is_none());
    }
}
