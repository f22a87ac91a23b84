use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use agri_vision_queue::app_state::{AppState, Collaborators};
use agri_vision_queue::clock::SystemClock;
use agri_vision_queue::config::AppConfig;
use agri_vision_queue::db;
use agri_vision_queue::routes::build_router;
use agri_vision_queue::services::{
    inference::VisionServiceClient,
    job_store::{InMemoryJobStore, JobStore},
    storage::{BlobStore, FsBlobStore, R2Client},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing agri-vision-queue server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    let store: Arc<dyn JobStore> = match config.database_url.as_deref() {
        Some(database_url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let db_pool = db::init_pool(database_url, config.db_max_connections)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running database migrations");
            db::run_migrations(&db_pool)
                .await
                .expect("Failed to run database migrations");
            Arc::new(db::PgJobStore::new(db_pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory only");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let blobs: Arc<dyn BlobStore> = match config.r2() {
        Some((bucket, endpoint, access_key, secret_key)) => {
            tracing::info!("Initializing R2 storage client");
            Arc::new(
                R2Client::new(bucket, endpoint, access_key, secret_key)
                    .expect("Failed to initialize R2 client"),
            )
        }
        None => {
            tracing::info!(dir = %config.image_dir, "Storing images on the local filesystem");
            Arc::new(FsBlobStore::new(&config.image_dir))
        }
    };

    tracing::info!(url = %config.vision_service_url, "Initializing vision service client");
    let vision = Arc::new(
        VisionServiceClient::new(&config.vision_service_url, config.inference_timeout())
            .expect("Failed to initialize vision service client"),
    );

    let state = AppState::assemble(
        &config,
        Collaborators {
            store,
            blobs,
            backend: vision.clone(),
            loader: vision,
            clock: Arc::new(SystemClock),
        },
        prometheus_handle,
    )
    .expect("Failed to assemble application state");

    let app = build_router(state.clone());

    tracing::info!("Starting agri-vision-queue on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Draining workers");
    state.shutdown().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

fn describe_metrics() {
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time from claim to terminal outcome for one job attempt"
    );
    metrics::describe_counter!("jobs_submitted_total", "Jobs accepted by admission");
    metrics::describe_counter!("jobs_completed_total", "Jobs that finished successfully");
    metrics::describe_counter!("jobs_failed_total", "Jobs that failed terminally");
    metrics::describe_counter!("jobs_retried_total", "Job attempts scheduled for retry");
    metrics::describe_counter!("jobs_cancelled_total", "Jobs cancelled by clients");
    metrics::describe_counter!(
        "admission_rejected_total",
        "Submissions refused by the circuit breaker"
    );
    metrics::describe_counter!("images_stored_total", "Images uploaded");
    metrics::describe_counter!("images_expired_total", "Images removed by the retention sweeper");
    metrics::describe_counter!("jobs_purged_total", "Terminal jobs removed by the retention sweeper");
    metrics::describe_counter!("model_loads_total", "Models loaded onto the GPU");
    metrics::describe_counter!("model_evictions_total", "Models evicted from the GPU");
    metrics::describe_gauge!("queue_depth", "Jobs waiting to be claimed");
    metrics::describe_gauge!("active_workers", "Workers currently executing a job");
    metrics::describe_gauge!("vram_reserved_bytes", "VRAM reserved, including the safety margin");
}
