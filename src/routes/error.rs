use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::admission::AdmissionError;
use crate::services::breaker::Rejection;
use crate::services::images::ImageError;
use crate::services::job_store::StoreError;

/// Error body returned by every API route.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            Self::Admission(error) => match error {
                AdmissionError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                AdmissionError::Overloaded(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "service_overloaded")
                }
                AdmissionError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                AdmissionError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
                AdmissionError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
            Self::Image(error) => match error {
                ImageError::Empty => (StatusCode::BAD_REQUEST, "validation_error"),
                ImageError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "validation_error"),
                ImageError::UnsupportedFormat => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "validation_error")
                }
                ImageError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ImageError::Decrypt(_) | ImageError::Storage(_) | ImageError::Store(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
                }
            },
            Self::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "Request failed");
        }

        let retry_after = match &self {
            Self::Admission(AdmissionError::Overloaded(Rejection::CircuitOpen {
                retry_after_secs,
            })) => HeaderValue::from_str(&retry_after_secs.to_string()).ok(),
            _ => None,
        };

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
