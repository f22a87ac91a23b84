use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{Job, JobErrorCode, JobKind};
use crate::models::model::{ModelCatalog, ModelSpec};
use crate::services::images::{ImageError, ImageService};
use crate::services::inference::{InferenceBackend, InferenceError};
use crate::services::residency::{ModelLease, ModelResidencyManager, ResidencyError};

/// Asked at each safe point whether the job was cancelled meanwhile.
#[async_trait]
pub trait CancellationProbe: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Probe for callers that never cancel.
pub struct NeverCancelled;

#[async_trait]
impl CancellationProbe for NeverCancelled {
    async fn is_cancelled(&self) -> bool {
        false
    }
}

/// Runs one job: load the image, make the models resident, call the vision
/// service, merge the results.
pub struct InferenceExecutor {
    residency: Arc<ModelResidencyManager>,
    backend: Arc<dyn InferenceBackend>,
    images: Arc<ImageService>,
    catalog: ModelCatalog,
    inference_timeout: Duration,
}

impl InferenceExecutor {
    pub fn new(
        residency: Arc<ModelResidencyManager>,
        backend: Arc<dyn InferenceBackend>,
        images: Arc<ImageService>,
        catalog: ModelCatalog,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            residency,
            backend,
            images,
            catalog,
            inference_timeout,
        }
    }

    /// Execute `job`. Model leases are released on every return path.
    pub async fn execute(
        &self,
        job: &Job,
        cancellation: &dyn CancellationProbe,
    ) -> Result<serde_json::Value, ExecutionError> {
        if cancellation.is_cancelled().await {
            return Err(ExecutionError::Cancelled);
        }

        let image = self.images.load(&job.payload_ref).await?;

        let required = self.catalog.models_for(job.kind);
        let mut leases: Vec<ModelLease> = Vec::with_capacity(required.len());
        for model in &required {
            leases.push(self.residency.acquire(&model.name).await?);
        }
        tracing::debug!(job_id = %job.id, models = leases.len(), "Models acquired");

        if cancellation.is_cancelled().await {
            return Err(ExecutionError::Cancelled);
        }

        let result = match job.kind {
            JobKind::PestDetection => {
                self.infer(&self.catalog.detector, &image.bytes, &job.options)
                    .await?
            }
            JobKind::DiseaseDetection => {
                self.infer(&self.catalog.diagnosis, &image.bytes, &job.options)
                    .await?
            }
            JobKind::Comprehensive => {
                let pests = self
                    .infer(&self.catalog.detector, &image.bytes, &job.options)
                    .await?;
                if cancellation.is_cancelled().await {
                    return Err(ExecutionError::Cancelled);
                }
                let disease = self
                    .infer(&self.catalog.diagnosis, &image.bytes, &job.options)
                    .await?;
                serde_json::json!({
                    "pest_detection": pests,
                    "disease_detection": disease,
                })
            }
        };

        drop(leases);
        Ok(result)
    }

    async fn infer(
        &self,
        model: &ModelSpec,
        image: &[u8],
        options: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        match tokio::time::timeout(
            self.inference_timeout,
            self.backend.infer(&model.name, image, options),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ExecutionError::Transient(format!(
                "{} did not answer within {:?}",
                model.name, self.inference_timeout
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("{0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    /// Anything that could not be classified. Retried once.
    #[error("{0}")]
    Unclassified(String),
}

impl ExecutionError {
    /// Code recorded on the job. Cancellation is not an error outcome.
    pub fn code(&self) -> Option<JobErrorCode> {
        match self {
            Self::Cancelled => None,
            Self::ResourceExhausted(_) => Some(JobErrorCode::ResourceExhausted),
            Self::Transient(_) | Self::Unclassified(_) => Some(JobErrorCode::TransientError),
            Self::Permanent(_) => Some(JobErrorCode::PermanentError),
        }
    }
}

impl From<ResidencyError> for ExecutionError {
    fn from(error: ResidencyError) -> Self {
        match error {
            ResidencyError::UnknownModel(_)
            | ResidencyError::DuplicateModel(_)
            | ResidencyError::ExceedsBudget { .. } => Self::Permanent(error.to_string()),
            ResidencyError::ResourceExhausted { .. }
            | ResidencyError::Timeout { .. }
            | ResidencyError::Unload { .. } => Self::ResourceExhausted(error.to_string()),
            ResidencyError::Load { .. } => Self::Transient(error.to_string()),
        }
    }
}

impl From<InferenceError> for ExecutionError {
    fn from(error: InferenceError) -> Self {
        match error {
            InferenceError::Transient(message) => Self::Transient(message),
            InferenceError::Permanent(message) => Self::Permanent(message),
        }
    }
}

impl From<ImageError> for ExecutionError {
    fn from(error: ImageError) -> Self {
        match error {
            ImageError::NotFound(_)
            | ImageError::Decrypt(_)
            | ImageError::Empty
            | ImageError::TooLarge { .. }
            | ImageError::UnsupportedFormat => Self::Permanent(error.to_string()),
            ImageError::Storage(_) | ImageError::Store(_) => Self::Unclassified(error.to_string()),
        }
    }
}
