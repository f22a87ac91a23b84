//! Decides which models live on the GPU.
//!
//! Every load and eviction goes through [`ModelResidencyManager`], which keeps
//! the [`ResourceLedger`] and each model's state in step:
//!
//! - A resident model is leased without touching the transition lock, so jobs
//!   on different resident models never wait on each other.
//! - Loads and evictions hold the transition lock, so at most one model is
//!   ever `loading` or `evicting`.
//! - Releasing a lease leaves the model resident. Weights are only unloaded
//!   when another model needs the budget, picking the least recently used
//!   idle model first and the larger one on ties.

use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::models::model::{ModelSpec, ModelState, ModelStatus};
use crate::services::inference::{InferenceError, ModelLoader};
use crate::services::ledger::ResourceLedger;

pub struct ModelResidencyManager {
    ledger: Arc<ResourceLedger>,
    loader: Arc<dyn ModelLoader>,
    clock: Arc<dyn Clock>,
    slots: HashMap<String, Arc<ModelSlot>>,
    transition: tokio::sync::Mutex<()>,
    acquire_timeout: Duration,
}

struct ModelSlot {
    spec: ModelSpec,
    inner: Mutex<SlotInner>,
    drained: Notify,
}

struct SlotInner {
    state: ModelState,
    in_flight: usize,
    last_used_at: Option<DateTime<Utc>>,
}

impl ModelSlot {
    fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            inner: Mutex::new(SlotInner {
                state: ModelState::Unloaded,
                in_flight: 0,
                last_used_at: None,
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ModelState) {
        self.lock().state = state;
    }

    fn finish_lease(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no lease on this model is outstanding.
    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Permission to run inference on a resident model.
///
/// The model cannot be evicted while a lease is outstanding. Dropping the
/// lease releases it; releasing it explicitly first is harmless.
pub struct ModelLease {
    slot: Arc<ModelSlot>,
    released: AtomicBool,
}

impl ModelLease {
    fn new(slot: Arc<ModelSlot>) -> Self {
        Self {
            slot,
            released: AtomicBool::new(false),
        }
    }

    pub fn model(&self) -> &str {
        &self.slot.spec.name
    }

    /// Returns `true` only for the call that actually released the lease.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.slot.finish_lease();
        true
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("model", &self.slot.spec.name)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

impl ModelResidencyManager {
    pub fn new(
        ledger: Arc<ResourceLedger>,
        loader: Arc<dyn ModelLoader>,
        clock: Arc<dyn Clock>,
        models: impl IntoIterator<Item = ModelSpec>,
        acquire_timeout: Duration,
    ) -> Result<Self, ResidencyError> {
        let mut slots = HashMap::new();
        for spec in models {
            if spec.footprint_bytes > ledger.capacity() {
                return Err(ResidencyError::ExceedsBudget {
                    model: spec.name,
                    footprint_bytes: spec.footprint_bytes,
                    capacity_bytes: ledger.capacity(),
                });
            }
            if slots.contains_key(&spec.name) {
                return Err(ResidencyError::DuplicateModel(spec.name));
            }
            slots.insert(spec.name.clone(), Arc::new(ModelSlot::new(spec)));
        }

        Ok(Self {
            ledger,
            loader,
            clock,
            slots,
            transition: tokio::sync::Mutex::new(()),
            acquire_timeout,
        })
    }

    /// Lease `model`, loading it first if needed.
    ///
    /// Fails with [`ResidencyError::ResourceExhausted`] when the model is not
    /// resident and evicting every idle model would still not free enough
    /// VRAM, and with [`ResidencyError::Timeout`] when another load or
    /// eviction holds the GPU for longer than the acquire timeout.
    pub async fn acquire(&self, model: &str) -> Result<ModelLease, ResidencyError> {
        let slot = self
            .slots
            .get(model)
            .cloned()
            .ok_or_else(|| ResidencyError::UnknownModel(model.to_string()))?;

        if let Some(lease) = self.try_lease(&slot) {
            return Ok(lease);
        }

        let _transition = tokio::time::timeout(self.acquire_timeout, self.transition.lock())
            .await
            .map_err(|_| ResidencyError::Timeout {
                model: model.to_string(),
                after: self.acquire_timeout,
            })?;

        // Someone else may have loaded it while we waited.
        if let Some(lease) = self.try_lease(&slot) {
            return Ok(lease);
        }

        let footprint = slot.spec.footprint_bytes;
        if !self.ledger.reserve(footprint) {
            self.make_room(&slot.spec).await?;
            if !self.ledger.reserve(footprint) {
                return Err(self.exhausted(&slot.spec));
            }
        }

        slot.set_state(ModelState::Loading);
        tracing::info!(model = %slot.spec.name, footprint_bytes = footprint, "Loading model");

        if let Err(source) = self.loader.load(&slot.spec).await {
            self.ledger.release(footprint);
            slot.set_state(ModelState::Unloaded);
            tracing::warn!(model = %slot.spec.name, error = %source, "Model load failed");
            return Err(ResidencyError::Load {
                model: slot.spec.name.clone(),
                source,
            });
        }

        {
            let mut inner = slot.lock();
            inner.state = ModelState::Resident;
            inner.in_flight += 1;
            inner.last_used_at = Some(self.clock.now());
        }
        metrics::counter!("model_loads_total", "model" => slot.spec.name.clone()).increment(1);
        tracing::info!(model = %slot.spec.name, "Model resident");

        Ok(ModelLease::new(slot))
    }

    /// Finish a lease. Idempotent per lease; the model stays resident.
    pub fn release(&self, lease: &ModelLease) -> bool {
        lease.release()
    }

    /// Unload `model` now, waiting for in-flight inference to finish first.
    /// Returns `false` when the model was not resident.
    pub async fn evict(&self, model: &str) -> Result<bool, ResidencyError> {
        let slot = self
            .slots
            .get(model)
            .cloned()
            .ok_or_else(|| ResidencyError::UnknownModel(model.to_string()))?;

        let _transition = tokio::time::timeout(self.acquire_timeout, self.transition.lock())
            .await
            .map_err(|_| ResidencyError::Timeout {
                model: model.to_string(),
                after: self.acquire_timeout,
            })?;

        self.evict_slot(&slot).await
    }

    pub fn status(&self) -> Vec<ModelStatus> {
        let mut status: Vec<_> = self
            .slots
            .values()
            .map(|slot| {
                let inner = slot.lock();
                ModelStatus {
                    name: slot.spec.name.clone(),
                    footprint_bytes: slot.spec.footprint_bytes,
                    state: inner.state,
                    in_flight: inner.in_flight,
                    last_used_at: inner.last_used_at,
                }
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Sum of footprints of every model currently resident.
    pub fn resident_bytes(&self) -> u64 {
        self.slots
            .values()
            .filter(|slot| slot.lock().state == ModelState::Resident)
            .map(|slot| slot.spec.footprint_bytes)
            .sum()
    }

    fn try_lease(&self, slot: &Arc<ModelSlot>) -> Option<ModelLease> {
        let mut inner = slot.lock();
        if inner.state != ModelState::Resident {
            return None;
        }
        inner.in_flight += 1;
        inner.last_used_at = Some(self.clock.now());
        drop(inner);
        Some(ModelLease::new(Arc::clone(slot)))
    }

    /// Evict idle resident models until `wanted` fits. Caller holds the
    /// transition lock.
    async fn make_room(&self, wanted: &ModelSpec) -> Result<(), ResidencyError> {
        let shortfall = wanted.footprint_bytes.saturating_sub(self.ledger.available());

        let mut idle: Vec<(Arc<ModelSlot>, Option<DateTime<Utc>>)> = self
            .slots
            .values()
            .filter_map(|slot| {
                let inner = slot.lock();
                (inner.state == ModelState::Resident && inner.in_flight == 0)
                    .then(|| (Arc::clone(slot), inner.last_used_at))
            })
            .collect();
        idle.sort_by(|(a, a_used), (b, b_used)| eviction_order(a, *a_used, b, *b_used));

        let mut freed = 0u64;
        let mut victims = Vec::new();
        for (slot, _) in idle {
            if freed >= shortfall {
                break;
            }
            freed += slot.spec.footprint_bytes;
            victims.push(slot);
        }

        if freed < shortfall {
            return Err(self.exhausted(wanted));
        }

        for victim in victims {
            tracing::info!(
                model = %victim.spec.name,
                for_model = %wanted.name,
                "Evicting idle model to make room"
            );
            self.evict_slot(&victim).await?;
        }
        Ok(())
    }

    /// Caller holds the transition lock.
    async fn evict_slot(&self, slot: &ModelSlot) -> Result<bool, ResidencyError> {
        {
            let mut inner = slot.lock();
            if inner.state != ModelState::Resident {
                return Ok(false);
            }
            inner.state = ModelState::Evicting;
        }

        // New leases are refused from here on; wait out the ones already granted.
        slot.wait_drained().await;

        if let Err(source) = self.loader.unload(&slot.spec).await {
            slot.set_state(ModelState::Resident);
            tracing::warn!(model = %slot.spec.name, error = %source, "Model unload failed");
            return Err(ResidencyError::Unload {
                model: slot.spec.name.clone(),
                source,
            });
        }

        self.ledger.release(slot.spec.footprint_bytes);
        slot.set_state(ModelState::Unloaded);
        metrics::counter!("model_evictions_total", "model" => slot.spec.name.clone()).increment(1);
        tracing::info!(model = %slot.spec.name, "Model evicted");
        Ok(true)
    }

    fn exhausted(&self, wanted: &ModelSpec) -> ResidencyError {
        ResidencyError::ResourceExhausted {
            model: wanted.name.clone(),
            needed_bytes: wanted.footprint_bytes,
            available_bytes: self.ledger.available(),
        }
    }
}

/// Least recently used first; on equal use time the larger model goes first.
fn eviction_order(
    a: &ModelSlot,
    a_used: Option<DateTime<Utc>>,
    b: &ModelSlot,
    b_used: Option<DateTime<Utc>>,
) -> CmpOrdering {
    a_used
        .cmp(&b_used)
        .then_with(|| b.spec.footprint_bytes.cmp(&a.spec.footprint_bytes))
}

#[derive(Debug, thiserror::Error)]
pub enum ResidencyError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("model registered twice: {0}")]
    DuplicateModel(String),

    #[error("model {model} needs {footprint_bytes} bytes but only {capacity_bytes} can ever be reserved")]
    ExceedsBudget {
        model: String,
        footprint_bytes: u64,
        capacity_bytes: u64,
    },

    #[error("not enough idle VRAM for {model}: need {needed_bytes} bytes, {available_bytes} available")]
    ResourceExhausted {
        model: String,
        needed_bytes: u64,
        available_bytes: u64,
    },

    #[error("timed out after {after:?} waiting for the GPU to load {model}")]
    Timeout { model: String, after: Duration },

    #[error("failed to load {model}: {source}")]
    Load {
        model: String,
        #[source]
        source: InferenceError,
    },

    #[error("failed to unload {model}: {source}")]
    Unload {
        model: String,
        #[source]
        source: InferenceError,
    },
}
