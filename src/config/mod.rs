use serde::Deserialize;
use std::time::Duration;

use crate::models::model::{ModelCatalog, ModelSpec};
use crate::services::breaker::BreakerConfig;
use crate::services::pool::{PoolConfig, RetryPolicy};
use crate::services::sweeper::RetentionConfig;

const MIB: u64 = 1024 * 1024;

/// Process configuration, read from the environment (and `.env`).
///
/// Every field has a default so the service starts with no configuration
/// at all: in-memory job store, images under `./data/images`, vision
/// service on localhost.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string. Without it jobs live in memory.
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Directory for uploaded images when R2 is not configured.
    #[serde(default = "default_image_dir")]
    pub image_dir: String,

    /// R2 bucket name
    #[serde(default)]
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    #[serde(default)]
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    #[serde(default)]
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    #[serde(default)]
    pub r2_secret_key: Option<String>,

    /// AES-256-GCM encryption key (base64-encoded, 32 bytes)
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Base URL of the vision service hosting the models
    #[serde(default = "default_vision_service_url")]
    pub vision_service_url: String,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_detector_model")]
    pub detector_model: String,

    #[serde(default = "default_detector_footprint_mb")]
    pub detector_footprint_mb: u64,

    #[serde(default = "default_diagnosis_model")]
    pub diagnosis_model: String,

    #[serde(default = "default_diagnosis_footprint_mb")]
    pub diagnosis_footprint_mb: u64,

    /// Total GPU memory the models may use
    #[serde(default = "default_vram_budget_mb")]
    pub vram_budget_mb: u64,

    /// Memory held back for activations of in-flight inference
    #[serde(default = "default_vram_safety_margin_mb")]
    pub vram_safety_margin_mb: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_unclassified_max_attempts")]
    pub retry_unclassified_max_attempts: u32,

    #[serde(default = "default_retry_resource_max_attempts")]
    pub retry_resource_max_attempts: u32,

    #[serde(default = "default_queue_ceiling")]
    pub queue_ceiling: usize,

    #[serde(default = "default_breaker_failure_rate")]
    pub breaker_failure_rate: f64,

    #[serde(default = "default_breaker_min_samples")]
    pub breaker_min_samples: usize,

    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,

    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    #[serde(default = "default_breaker_half_open_probes")]
    pub breaker_half_open_probes: usize,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_image_ttl_secs")]
    pub image_ttl_secs: u64,

    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_image_dir() -> String {
    "./data/images".to_string()
}
fn default_vision_service_url() -> String {
    "http://localhost:2001".to_string()
}
fn default_inference_timeout_secs() -> u64 {
    120
}
fn default_detector_model() -> String {
    "yolo11s-pest-detection".to_string()
}
fn default_detector_footprint_mb() -> u64 {
    1024
}
fn default_diagnosis_model() -> String {
    "llava-v1.5-7b-plant-disease".to_string()
}
fn default_diagnosis_footprint_mb() -> u64 {
    14 * 1024
}
fn default_vram_budget_mb() -> u64 {
    16 * 1024
}
fn default_vram_safety_margin_mb() -> u64 {
    1024
}
fn default_worker_count() -> usize {
    2
}
fn default_lease_ttl_secs() -> u64 {
    60
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_reaper_interval_secs() -> u64 {
    15
}
fn default_acquire_timeout_secs() -> u64 {
    30
}
fn default_retry_base_delay_secs() -> u64 {
    2
}
fn default_retry_max_delay_secs() -> u64 {
    60
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_unclassified_max_attempts() -> u32 {
    2
}
fn default_retry_resource_max_attempts() -> u32 {
    10
}
fn default_queue_ceiling() -> usize {
    100
}
fn default_breaker_failure_rate() -> f64 {
    0.5
}
fn default_breaker_min_samples() -> usize {
    10
}
fn default_breaker_window_secs() -> u64 {
    60
}
fn default_breaker_cooldown_secs() -> u64 {
    30
}
fn default_breaker_half_open_probes() -> usize {
    1
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_image_ttl_secs() -> u64 {
    86_400
}
fn default_job_retention_secs() -> u64 {
    86_400
}
fn default_sweep_batch_size() -> usize {
    500
}
fn default_max_image_bytes() -> u64 {
    10 * MIB
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Build from explicit `(NAME, value)` pairs instead of the process
    /// environment.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }

    /// R2 credentials, when all four are present.
    pub fn r2(&self) -> Option<(&str, &str, &str, &str)> {
        Some((
            self.r2_bucket.as_deref()?,
            self.r2_endpoint.as_deref()?,
            self.r2_access_key.as_deref()?,
            self.r2_secret_key.as_deref()?,
        ))
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog {
            detector: ModelSpec::new(&self.detector_model, self.detector_footprint_mb * MIB),
            diagnosis: ModelSpec::new(&self.diagnosis_model, self.diagnosis_footprint_mb * MIB),
        }
    }

    pub fn vram_budget_bytes(&self) -> u64 {
        self.vram_budget_mb * MIB
    }

    pub fn vram_safety_margin_bytes(&self) -> u64 {
        self.vram_safety_margin_mb * MIB
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn image_ttl(&self) -> Duration {
        Duration::from_secs(self.image_ttl_secs)
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            workers: self.worker_count,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
        }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            max_attempts: self.retry_max_attempts,
            unclassified_max_attempts: self.retry_unclassified_max_attempts,
            resource_max_attempts: self.retry_resource_max_attempts,
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            queue_ceiling: self.queue_ceiling,
            failure_rate_threshold: self.breaker_failure_rate,
            min_samples: self.breaker_min_samples,
            window: Duration::from_secs(self.breaker_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
            half_open_probes: self.breaker_half_open_probes,
        }
    }

    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            job_retention: Duration::from_secs(self.job_retention_secs),
            batch_size: self.sweep_batch_size,
        }
    }
}
