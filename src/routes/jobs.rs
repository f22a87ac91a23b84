use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::{JobStatusResponse, SubmitJobRequest, SubmitJobResponse};
use crate::models::job::JobId;
use crate::routes::error::ApiError;

/// POST /api/v1/jobs: Queue an analysis of a previously uploaded image.
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let job = state.gateway.submit(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.state,
        }),
    ))
}

/// GET /api/v1/jobs/{job_id}: Poll a job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.gateway.status(&JobId::from(job_id)).await?;
    Ok(Json(job.into()))
}

/// DELETE /api/v1/jobs/{job_id}: Cancel a queued or running job.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<JobStatusResponse>), ApiError> {
    let job = state.gateway.cancel(&JobId::from(job_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}
