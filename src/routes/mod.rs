use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod admin;
pub mod error;
pub mod health;
pub mod images;
pub mod jobs;
pub mod metrics;
pub mod stats;

/// Room for multipart framing on top of the largest accepted image.
const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let body_limit =
        usize::try_from(state.images.max_bytes() + MULTIPART_OVERHEAD_BYTES).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/api/v1/images", post(images::upload_image))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job).delete(jobs::cancel_job),
        )
        .route("/api/v1/stats", get(stats::get_stats))
        .route("/api/v1/admin/cleanup", post(admin::run_cleanup))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
}
