use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::routes::error::ApiError;
use crate::services::sweeper::SweepReport;

/// POST /api/v1/admin/cleanup: Run one retention sweep now.
pub async fn run_cleanup(State(state): State<AppState>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.sweeper.sweep_once().await?))
}
