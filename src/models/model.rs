use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::job::JobKind;

/// A model that can be made resident on the GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// VRAM the model occupies once loaded.
    pub footprint_bytes: u64,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, footprint_bytes: u64) -> Self {
        Self {
            name: name.into(),
            footprint_bytes,
        }
    }
}

/// Residency state of a registered model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Resident,
    Evicting,
}

/// Point-in-time view of one model, reported by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub footprint_bytes: u64,
    pub state: ModelState,
    pub in_flight: usize,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The two models the service runs: a small pest detector and a large
/// vision-language model used for disease diagnosis.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub detector: ModelSpec,
    pub diagnosis: ModelSpec,
}

impl ModelCatalog {
    /// Models a job of `kind` needs, in the order they must be acquired.
    ///
    /// Acquisition order is by name so that two comprehensive jobs never
    /// wait on each other in opposite orders.
    pub fn models_for(&self, kind: JobKind) -> Vec<&ModelSpec> {
        let mut models = match kind {
            JobKind::PestDetection => vec![&self.detector],
            JobKind::DiseaseDetection => vec![&self.diagnosis],
            JobKind::Comprehensive => vec![&self.detector, &self.diagnosis],
        };
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    pub fn all(&self) -> [&ModelSpec; 2] {
        [&self.detector, &self.diagnosis]
    }
}
