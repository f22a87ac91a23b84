//! Test helper utilities: an in-process application wired to in-memory
//! stores and a scripted vision service.

#![allow(dead_code)]

use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use agri_vision_queue::{
    app_state::{AppState, Collaborators},
    clock::{Clock, SystemClock},
    config::AppConfig,
    models::{
        job::{Job, JobId},
        model::ModelSpec,
    },
    services::{
        inference::{InferenceBackend, InferenceError, ModelLoader},
        job_store::{InMemoryJobStore, JobStore},
        storage::InMemoryBlobStore,
    },
};

/// Smallest byte string `image::guess_format` recognises as PNG.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

/// Vision service stand-in. Answers every call with a small JSON document,
/// optionally failing or blocking first.
#[derive(Default)]
pub struct FakeInference {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<InferenceError>>,
    gate: Option<Arc<Semaphore>>,
    /// Notified each time a call starts.
    pub started: Notify,
}

impl FakeInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits for a permit on the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fake = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (fake, gate)
    }

    pub fn fail_next(&self, error: InferenceError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceBackend for FakeInference {
    async fn infer(
        &self,
        model: &str,
        _image: &[u8],
        _options: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        self.calls.lock().unwrap().push(model.to_string());
        self.started.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| InferenceError::Transient("gate closed".into()))?
                .forget();
        }

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(serde_json::json!({ "model": model, "detections": [] }))
    }
}

/// Records load and unload requests.
#[derive(Default)]
pub struct FakeLoader {
    pub loads: Mutex<Vec<String>>,
    pub unloads: Mutex<Vec<String>>,
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load(&self, model: &ModelSpec) -> Result<(), InferenceError> {
        self.loads.lock().unwrap().push(model.name.clone());
        Ok(())
    }

    async fn unload(&self, model: &ModelSpec) -> Result<(), InferenceError> {
        self.unloads.lock().unwrap().push(model.name.clone());
        Ok(())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryJobStore>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub backend: Arc<FakeInference>,
    pub loader: Arc<FakeLoader>,
}

/// Fast-moving configuration: one worker, 10 ms polling, immediate retries.
/// `overrides` are applied on top as environment-style pairs.
pub fn test_config(overrides: &[(&str, &str)]) -> AppConfig {
    let mut vars: BTreeMap<String, String> = [
        ("WORKER_COUNT", "1"),
        ("POLL_INTERVAL_MS", "10"),
        ("RETRY_BASE_DELAY_SECS", "0"),
        ("RETRY_MAX_DELAY_SECS", "0"),
        ("ACQUIRE_TIMEOUT_SECS", "5"),
        ("INFERENCE_TIMEOUT_SECS", "5"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    // Later keys replace earlier ones; envy rejects duplicates.
    vars.extend(overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())));

    AppConfig::from_vars(vars).expect("test configuration")
}

pub fn spawn_app(config: &AppConfig) -> TestApp {
    spawn_app_with(config, FakeInference::new(), Arc::new(SystemClock))
}

pub fn spawn_app_with(config: &AppConfig, backend: FakeInference, clock: Arc<dyn Clock>) -> TestApp {
    let store = Arc::new(InMemoryJobStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let backend = Arc::new(backend);
    let loader = Arc::new(FakeLoader::default());

    let state = AppState::assemble(
        config,
        Collaborators {
            store: store.clone(),
            blobs: blobs.clone(),
            backend: backend.clone(),
            loader: loader.clone(),
            clock,
        },
        PrometheusBuilder::new().build_recorder().handle(),
    )
    .expect("assemble application state");

    TestApp {
        state,
        store,
        blobs,
        backend,
        loader,
    }
}

/// Poll the store until `done` holds for the job, or panic after five seconds.
pub async fn wait_for_job<F>(store: &dyn JobStore, id: &JobId, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = store.get(id).await.unwrap().expect("job exists");
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {} (attempts {})",
            job.state,
            job.attempts
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
