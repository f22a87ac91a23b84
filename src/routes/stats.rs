use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::StatsResponse;
use crate::routes::error::ApiError;

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        queue_depth: state.gateway.queue_depth().await?,
        active_workers: state.pool.active_workers(),
        breaker_state: state.gateway.breaker_state(),
        vram: state.ledger.snapshot(),
        models: state.residency.status(),
    }))
}
