use axum::extract::State;
use axum::response::IntoResponse;

use crate::app_state::AppState;

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.gateway.queue_depth().await {
        Ok(depth) => metrics::gauge!("queue_depth").set(depth as f64),
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth for metrics"),
    }
    metrics::gauge!("active_workers").set(state.pool.active_workers() as f64);

    state.metrics.render()
}
