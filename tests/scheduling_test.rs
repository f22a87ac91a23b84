//! Scheduling behaviour of the assembled service: admission backpressure,
//! VRAM-constrained execution, cancellation, retries and retention.
//!
//! Everything runs in-process against the in-memory job and blob stores.

mod helpers;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use agri_vision_queue::{
    clock::{Clock, ManualClock, SystemClock},
    models::{
        api::SubmitJobRequest,
        job::{JobErrorCode, JobKind, JobState},
        model::ModelState,
    },
    services::{
        admission::AdmissionError,
        breaker::{BreakerState, Rejection},
        images::blob_key,
        inference::InferenceError,
        job_store::JobStore,
        storage::BlobStore,
    },
};
use helpers::*;

#[tokio::test]
async fn backlog_is_capped_at_the_queue_ceiling_until_it_drains() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = test_config(&[("WORKER_COUNT", "0"), ("QUEUE_CEILING", "20")]);
    let app = spawn_app_with(&config, FakeInference::new(), clock.clone());
    let image = app.state.images.store(PNG_BYTES).await.unwrap();

    let mut accepted = Vec::new();
    let mut overloaded = 0;
    for _ in 0..50 {
        match app
            .state
            .gateway
            .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
            .await
        {
            Ok(job) => {
                assert_eq!(job.state, JobState::Queued);
                accepted.push(job);
            }
            Err(AdmissionError::Overloaded(_)) => overloaded += 1,
            Err(other) => panic!("unexpected admission error: {other}"),
        }
    }

    assert_eq!(accepted.len(), 20);
    assert_eq!(overloaded, 30);
    assert_eq!(app.state.gateway.queue_depth().await.unwrap(), 20);
    assert_eq!(app.state.gateway.breaker_state(), BreakerState::Open);

    // Still open while the backlog drains.
    for job in &accepted[..15] {
        app.state.gateway.cancel(&job.id).await.unwrap();
    }
    let rejected = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
        .await;
    assert!(matches!(
        rejected,
        Err(AdmissionError::Overloaded(Rejection::CircuitOpen { .. }))
    ));

    clock.advance(Duration::from_secs(31));
    let probe = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
        .await
        .unwrap();
    assert_eq!(probe.state, JobState::Queued);
    assert_eq!(app.state.gateway.breaker_state(), BreakerState::HalfOpen);

    app.state.shutdown().await;
}

#[tokio::test]
async fn cancelled_or_silent_half_open_jobs_do_not_wedge_admission() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = test_config(&[
        ("WORKER_COUNT", "0"),
        ("QUEUE_CEILING", "2"),
        ("IMAGE_TTL_SECS", "604800"),
    ]);
    let app = spawn_app_with(&config, FakeInference::new(), clock.clone());
    let image = app.state.images.store(PNG_BYTES).await.unwrap();
    let submit = || {
        app.state
            .gateway
            .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
    };

    let first = submit().await.unwrap();
    let second = submit().await.unwrap();
    assert!(matches!(
        submit().await,
        Err(AdmissionError::Overloaded(Rejection::QueueFull { .. }))
    ));
    app.state.gateway.cancel(&first.id).await.unwrap();
    app.state.gateway.cancel(&second.id).await.unwrap();

    clock.advance(Duration::from_secs(31));
    let trial = submit().await.unwrap();
    assert_eq!(app.state.gateway.breaker_state(), BreakerState::HalfOpen);
    assert!(matches!(
        submit().await,
        Err(AdmissionError::Overloaded(Rejection::ProbesExhausted))
    ));

    // Cancelling the trial job hands its slot back.
    app.state.gateway.cancel(&trial.id).await.unwrap();
    submit().await.unwrap();
    assert!(matches!(
        submit().await,
        Err(AdmissionError::Overloaded(Rejection::ProbesExhausted))
    ));

    // A slot nobody reports on stops blocking after a cooldown.
    clock.advance(Duration::from_secs(86_400));
    let late = submit().await.unwrap();
    assert_eq!(late.state, JobState::Queued);
    assert_eq!(app.state.gateway.breaker_state(), BreakerState::HalfOpen);

    app.state.shutdown().await;
}

#[tokio::test]
async fn comprehensive_job_never_holds_vram_when_both_models_cannot_fit() {
    // 15 MiB usable: each model fits alone, never both together.
    let config = test_config(&[
        ("VRAM_BUDGET_MB", "16"),
        ("VRAM_SAFETY_MARGIN_MB", "1"),
        ("DETECTOR_FOOTPRINT_MB", "4"),
        ("DIAGNOSIS_FOOTPRINT_MB", "12"),
        ("RETRY_RESOURCE_MAX_ATTEMPTS", "2"),
    ]);
    let app = spawn_app(&config);
    let image = app.state.images.store(PNG_BYTES).await.unwrap();

    let job = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::Comprehensive, &image.image_ref))
        .await
        .unwrap();
    let failed = wait_for_job(app.store.as_ref(), &job.id, |j| j.state.is_terminal()).await;

    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.error.as_ref().map(|e| e.code),
        Some(JobErrorCode::ResourceExhausted)
    );
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.resource_failures, 1);
    assert_eq!(failed.transient_failures, 0);
    assert!(failed.result.is_none());
    assert!(app.backend.calls().is_empty());

    // No lease leaked and the ledger matches what is actually resident.
    let ledger = app.state.ledger.snapshot();
    assert!(ledger.reserved_bytes <= ledger.budget_bytes);
    assert_eq!(
        ledger.reserved_bytes,
        ledger.safety_margin_bytes + app.state.residency.resident_bytes()
    );
    assert!(app.state.residency.status().iter().all(|m| m.in_flight == 0));

    // Single-model work still runs, evicting whatever is idle.
    let pests = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
        .await
        .unwrap();
    let done = wait_for_job(app.store.as_ref(), &pests.id, |j| j.state.is_terminal()).await;
    assert_eq!(done.state, JobState::Completed);

    app.state.shutdown().await;
}

#[tokio::test]
async fn cancelled_running_job_stops_at_the_next_safe_point() {
    let (backend, gate) = FakeInference::gated();
    let config = test_config(&[]);
    let app = spawn_app_with(&config, backend, Arc::new(SystemClock));
    let image = app.state.images.store(PNG_BYTES).await.unwrap();

    let job = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::Comprehensive, &image.image_ref))
        .await
        .unwrap();

    // Detector call is in progress and cannot be interrupted.
    tokio::time::timeout(Duration::from_secs(5), app.backend.started.notified())
        .await
        .expect("inference started");
    let cancelled = app.state.gateway.cancel(&job.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    gate.add_permits(10);
    let job = wait_for_job(app.store.as_ref(), &job.id, |j| j.lease_owner.is_none()).await;

    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.result.is_none());
    assert!(job.error.is_none());
    assert_eq!(app.backend.calls().len(), 1, "diagnosis must not run");
    assert!(app.state.residency.status().iter().all(|m| m.in_flight == 0));

    let stored = app.store.get_image(&image.image_ref).await.unwrap().unwrap();
    assert_eq!(stored.ref_count, 0);

    // Cancelling again is a conflict, not a second transition.
    assert!(matches!(
        app.state.gateway.cancel(&job.id).await,
        Err(AdmissionError::Conflict {
            state: JobState::Cancelled,
            ..
        })
    ));

    app.state.shutdown().await;
}

#[tokio::test]
async fn every_job_is_executed_exactly_once_across_workers() {
    let config = test_config(&[("WORKER_COUNT", "4"), ("QUEUE_CEILING", "100")]);
    let app = spawn_app(&config);
    let image = app.state.images.store(PNG_BYTES).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..20 {
        let job = app
            .state
            .gateway
            .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
            .await
            .unwrap();
        ids.push(job.id);
    }

    for id in &ids {
        let job = wait_for_job(app.store.as_ref(), id, |j| j.state.is_terminal()).await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result.as_ref().unwrap()["model"], "yolo11s-pest-detection");
    }
    assert_eq!(app.backend.calls().len(), 20);

    // Loaded once and kept resident between jobs.
    assert_eq!(app.loader.loads.lock().unwrap().len(), 1);
    let detector = app
        .state
        .residency
        .status()
        .into_iter()
        .find(|m| m.name == "yolo11s-pest-detection")
        .unwrap();
    assert_eq!(detector.state, ModelState::Resident);

    app.state.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried_and_permanent_ones_are_not() {
    let config = test_config(&[("RETRY_MAX_ATTEMPTS", "3")]);
    let app = spawn_app(&config);
    let image = app.state.images.store(PNG_BYTES).await.unwrap();

    app.backend
        .fail_next(InferenceError::Transient("connection reset".into()));
    app.backend
        .fail_next(InferenceError::Transient("503 from vision service".into()));
    let flaky = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::DiseaseDetection, &image.image_ref))
        .await
        .unwrap();
    let flaky = wait_for_job(app.store.as_ref(), &flaky.id, |j| j.state.is_terminal()).await;
    assert_eq!(flaky.state, JobState::Completed);
    assert_eq!(flaky.attempts, 3);
    assert!(flaky.error.is_none());

    app.backend
        .fail_next(InferenceError::Permanent("unsupported image".into()));
    let broken = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::DiseaseDetection, &image.image_ref))
        .await
        .unwrap();
    let broken = wait_for_job(app.store.as_ref(), &broken.id, |j| j.state.is_terminal()).await;
    assert_eq!(broken.state, JobState::Failed);
    assert_eq!(broken.attempts, 1);
    assert_eq!(
        broken.error.map(|e| e.code),
        Some(JobErrorCode::PermanentError)
    );

    app.state.shutdown().await;
}

#[tokio::test]
async fn a_lost_lease_does_not_use_up_the_transient_retry_budget() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (backend, gate) = FakeInference::gated();
    let config = test_config(&[("RETRY_MAX_ATTEMPTS", "2")]);
    let app = spawn_app_with(&config, backend, clock.clone());
    let image = app.state.images.store(PNG_BYTES).await.unwrap();

    let job = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::PestDetection, &image.image_ref))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), app.backend.started.notified())
        .await
        .expect("first attempt started");

    // The worker looks dead: its lease runs out and the job goes back.
    clock.advance(Duration::from_secs(61));
    app.store
        .requeue_expired_leases(2, clock.now())
        .await
        .unwrap();
    let requeued = app.store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(requeued.state, JobState::Queued);
    assert_eq!(requeued.lease_losses, 1);

    // The stale attempt finishes, cannot persist, and the job is claimed again.
    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), app.backend.started.notified())
        .await
        .expect("second attempt started");

    app.backend
        .fail_next(InferenceError::Transient("connection reset".into()));
    gate.add_permits(10);
    let done = wait_for_job(app.store.as_ref(), &job.id, |j| j.state.is_terminal()).await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.lease_losses, 1);
    assert_eq!(done.transient_failures, 1);
    assert_eq!(done.resource_failures, 0);

    app.state.shutdown().await;
}

#[tokio::test]
async fn sweeper_keeps_images_that_running_jobs_still_reference() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let config = test_config(&[("WORKER_COUNT", "0"), ("IMAGE_TTL_SECS", "60")]);
    let app = spawn_app_with(&config, FakeInference::new(), clock.clone());

    let orphan = app.state.images.store(PNG_BYTES).await.unwrap();
    let in_use = app.state.images.store(PNG_BYTES).await.unwrap();
    let job = app
        .state
        .gateway
        .submit(SubmitJobRequest::new(JobKind::PestDetection, &in_use.image_ref))
        .await
        .unwrap();
    let running = app
        .store
        .claim(&job.id, "test-worker", Duration::from_secs(3600), clock.now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running.state, JobState::Running);

    clock.advance(Duration::from_secs(120));
    let report = app.state.sweeper.sweep_once().await.unwrap();

    assert_eq!(report.images_deleted, 1);
    assert_eq!(report.blob_failures, 0);
    assert!(app.store.get_image(&orphan.image_ref).await.unwrap().is_none());
    assert!(app.blobs.get(&blob_key(&orphan.image_ref)).await.is_err());

    let kept = app.store.get_image(&in_use.image_ref).await.unwrap().unwrap();
    assert_eq!(kept.ref_count, 1);
    assert!(app.state.images.load(&in_use.image_ref).await.is_ok());

    // Once the job finishes the image becomes collectable.
    app.store
        .complete(&job.id, "test-worker", serde_json::json!({}), clock.now())
        .await
        .unwrap();
    let report = app.state.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.images_deleted, 1);
    assert!(app.store.get_image(&in_use.image_ref).await.unwrap().is_none());

    app.state.shutdown().await;
}
