use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::services::{
    admission::AdmissionGateway,
    breaker::CircuitBreaker,
    encryption::{EncryptionError, EncryptionService},
    executor::InferenceExecutor,
    images::ImageService,
    inference::{InferenceBackend, ModelLoader},
    job_store::JobStore,
    ledger::{LedgerError, ResourceLedger},
    pool::{WorkerContext, WorkerPool},
    residency::{ModelResidencyManager, ResidencyError},
    storage::BlobStore,
    sweeper::RetentionSweeper,
};

/// Backends chosen at startup. Tests swap in in-memory stores and fake
/// inference.
pub struct Collaborators {
    pub store: Arc<dyn JobStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub backend: Arc<dyn InferenceBackend>,
    pub loader: Arc<dyn ModelLoader>,
    pub clock: Arc<dyn Clock>,
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub images: Arc<ImageService>,
    pub gateway: Arc<AdmissionGateway>,
    pub residency: Arc<ModelResidencyManager>,
    pub ledger: Arc<ResourceLedger>,
    pub pool: Arc<WorkerPool>,
    pub sweeper: Arc<RetentionSweeper>,
    pub metrics: Arc<PrometheusHandle>,
    background: Arc<Background>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Build every service and start the worker pool and retention sweeper.
    pub fn assemble(
        config: &AppConfig,
        collaborators: Collaborators,
        metrics: PrometheusHandle,
    ) -> Result<Self, StartupError> {
        let Collaborators {
            store,
            blobs,
            backend,
            loader,
            clock,
        } = collaborators;

        let encryption = config
            .encryption_key
            .as_deref()
            .map(EncryptionService::new)
            .transpose()?
            .map(Arc::new);
        if encryption.is_none() {
            tracing::warn!("ENCRYPTION_KEY not set, images are stored unencrypted");
        }

        let ledger = Arc::new(ResourceLedger::new(
            config.vram_budget_bytes(),
            config.vram_safety_margin_bytes(),
        )?);
        let catalog = config.catalog();
        let residency = Arc::new(ModelResidencyManager::new(
            Arc::clone(&ledger),
            loader,
            Arc::clone(&clock),
            catalog.all().into_iter().cloned(),
            config.acquire_timeout(),
        )?);

        let images = Arc::new(ImageService::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            encryption,
            Arc::clone(&clock),
            config.max_image_bytes,
            config.image_ttl(),
        ));

        let wakeup = Arc::new(Notify::new());
        let breaker = Arc::new(CircuitBreaker::new(config.breaker(), Arc::clone(&clock)));
        let gateway = Arc::new(AdmissionGateway::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            Arc::clone(&clock),
            Arc::clone(&wakeup),
        ));

        let executor = Arc::new(InferenceExecutor::new(
            Arc::clone(&residency),
            backend,
            Arc::clone(&images),
            catalog,
            config.inference_timeout(),
        ));
        let pool = Arc::new(WorkerPool::start(WorkerContext {
            store: Arc::clone(&store),
            executor,
            breaker,
            clock: Arc::clone(&clock),
            wakeup,
            retry: config.retry(),
            config: config.pool(),
        }));

        let sweeper = Arc::new(RetentionSweeper::new(
            Arc::clone(&store),
            blobs,
            clock,
            config.retention(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper_handle = Arc::clone(&sweeper).spawn(shutdown_rx);

        Ok(Self {
            store,
            images,
            gateway,
            residency,
            ledger,
            pool,
            sweeper,
            metrics: Arc::new(metrics),
            background: Arc::new(Background {
                shutdown,
                sweeper: Mutex::new(Some(sweeper_handle)),
            }),
        })
    }

    /// Drain the worker pool and stop the sweeper.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        let _ = self.background.shutdown.send(true);
        let handle = self
            .background
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Retention sweeper panicked");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid VRAM configuration: {0}")]
    Ledger(#[from] LedgerError),

    #[error("invalid model registry: {0}")]
    Residency(#[from] ResidencyError),

    #[error("invalid encryption key: {0}")]
    Encryption(#[from] EncryptionError),
}
