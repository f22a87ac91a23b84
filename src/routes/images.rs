use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::StoreImageResponse;
use crate::routes::error::ApiError;

/// POST /api/v1/images: Upload an image to analyse later.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StoreImageResponse>), ApiError> {
    let mut image_data = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() == Some("image") {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            image_data = Some(data);
        }
    }

    let data = image_data
        .ok_or_else(|| ApiError::BadRequest("missing multipart field `image`".to_string()))?;
    let stored = state.images.store(&data).await?;

    Ok((
        StatusCode::CREATED,
        Json(StoreImageResponse {
            image_ref: stored.image_ref,
            expires_at: stored.expires_at,
        }),
    ))
}
