use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::model::ModelSpec;

/// The one place model code runs. Implementations are slow and non-preemptible.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn infer(
        &self,
        model: &str,
        image: &[u8],
        options: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError>;
}

/// Moves model weights on and off the GPU.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model: &ModelSpec) -> Result<(), InferenceError>;
    async fn unload(&self, model: &ModelSpec) -> Result<(), InferenceError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    /// Timeouts, connection failures and provider hiccups. Worth retrying.
    #[error("transient inference failure: {0}")]
    Transient(String),

    /// Bad input or an unsupported format. Retrying cannot help.
    #[error("permanent inference failure: {0}")]
    Permanent(String),
}

impl InferenceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        let message = format!("vision service returned {status}: {body}");
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Permanent(format!("malformed vision service response: {error}"))
        } else {
            Self::Transient(error.to_string())
        }
    }
}

/// HTTP client for the vision service that hosts the detector and the
/// vision-language model.
pub struct VisionServiceClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct InferResponse {
    result: serde_json::Value,
}

impl VisionServiceClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn model_url(&self, model: &str, action: &str) -> String {
        format!("{}/v1/models/{}/{}", self.base_url, model, action)
    }

    async fn lifecycle_call(&self, model: &str, action: &str) -> Result<(), InferenceError> {
        let response = self.http.post(self.model_url(model, action)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for VisionServiceClient {
    async fn infer(
        &self,
        model: &str,
        image: &[u8],
        options: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
            "options": options,
        });

        let response = self
            .http
            .post(self.model_url(model, "infer"))
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }

        let body: InferResponse = response.json().await?;
        Ok(body.result)
    }
}

#[async_trait]
impl ModelLoader for VisionServiceClient {
    async fn load(&self, model: &ModelSpec) -> Result<(), InferenceError> {
        tracing::info!(model = %model.name, "Requesting model load from vision service");
        self.lifecycle_call(&model.name, "load").await
    }

    async fn unload(&self, model: &ModelSpec) -> Result<(), InferenceError> {
        tracing::info!(model = %model.name, "Requesting model unload from vision service");
        self.lifecycle_call(&model.name, "unload").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert!(InferenceError::from_status(StatusCode::BAD_GATEWAY, String::new()).is_transient());
        assert!(
            InferenceError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient()
        );
        assert!(
            !InferenceError::from_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, String::new())
                .is_transient()
        );
        assert!(!InferenceError::from_status(StatusCode::BAD_REQUEST, String::new()).is_transient());
    }

    #[test]
    fn builds_model_urls_without_double_slashes() {
        let client = VisionServiceClient::new("http://vision:2001/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.model_url("yolo11s", "infer"),
            "http://vision:2001/v1/models/yolo11s/infer"
        );
    }
}
