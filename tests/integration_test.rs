use chrono::Utc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use agri_vision_queue::{
    config::AppConfig,
    db::{self, PgJobStore},
    models::{
        image::{ImageRef, StoredImage},
        job::{JobError, JobErrorCode, JobKind, JobState, NewJob},
    },
    services::{
        encryption::EncryptionService,
        job_store::{CancelOutcome, JobStore, StoreError},
    },
};

async fn connect() -> PgJobStore {
    let config = AppConfig::from_env().expect("Failed to load config");
    let database_url = config
        .database_url
        .as_deref()
        .expect("DATABASE_URL must be set for integration tests");

    let db_pool = db::init_pool(database_url, 5)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    PgJobStore::new(db_pool)
}

fn image(expires_in: chrono::Duration) -> StoredImage {
    let now = Utc::now();
    let image_ref = ImageRef::generate();
    StoredImage {
        bytes_ref: format!("images/{image_ref}"),
        image_ref,
        mime_type: "image/png".to_string(),
        size_bytes: 1024,
        encrypted: false,
        stored_at: now,
        expires_at: now + expires_in,
        ref_count: 0,
    }
}

fn new_job(image: &StoredImage, kind: JobKind) -> NewJob {
    NewJob {
        kind,
        payload_ref: image.image_ref.clone(),
        options: serde_json::json!({}),
        priority: 0,
    }
}

/// Integration test: job lifecycle against PostgreSQL
///
/// 1. Image metadata insert and lookup
/// 2. Job creation takes an image reference
/// 3. Claim, heartbeat and completion by the owning worker
/// 4. Completion releases the image reference
///
/// Note: This requires a running PostgreSQL instance configured via
/// DATABASE_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_lifecycle() {
    let store = connect().await;
    let lease = Duration::from_secs(60);

    let stored = image(chrono::Duration::hours(1));
    assert_ok!(store.insert_image(stored.clone()).await);
    assert!(matches!(
        store.insert_image(stored.clone()).await,
        Err(StoreError::DuplicateImage(_))
    ));

    let job = store
        .create(new_job(&stored, JobKind::PestDetection), Utc::now())
        .await
        .expect("create job");
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 0);

    let image = store.get_image(&stored.image_ref).await.unwrap().unwrap();
    assert_eq!(image.ref_count, 1);

    let claimed = store
        .claim(&job.id, "it-worker", lease, Utc::now())
        .await
        .expect("claim")
        .expect("job was claimable");
    assert_eq!(claimed.state, JobState::Running);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.lease_owner.as_deref(), Some("it-worker"));

    // A second claim of the same job loses.
    assert!(store
        .claim(&job.id, "other-worker", lease, Utc::now())
        .await
        .unwrap()
        .is_none());

    assert!(store
        .heartbeat(&job.id, "it-worker", lease, Utc::now())
        .await
        .unwrap());
    assert!(!store
        .heartbeat(&job.id, "other-worker", lease, Utc::now())
        .await
        .unwrap());

    let result = serde_json::json!({ "detections": [] });
    let completed = store
        .complete(&job.id, "it-worker", result.clone(), Utc::now())
        .await
        .expect("complete");
    assert_eq!(completed.state, JobState::Completed);
    assert_eq!(completed.result, Some(result));
    assert!(completed.error.is_none());
    assert!(completed.lease_owner.is_none());

    let image = store.get_image(&stored.image_ref).await.unwrap().unwrap();
    assert_eq!(image.ref_count, 0);

    // Terminal jobs never move again.
    assert_err!(
        store
            .fail(
                &job.id,
                "it-worker",
                JobError::new(JobErrorCode::PermanentError, "late"),
                Utc::now(),
            )
            .await
    );
}

#[tokio::test]
#[ignore]
async fn test_cancel_and_lease_recovery() {
    let store = connect().await;
    let stored = image(chrono::Duration::hours(1));
    assert_ok!(store.insert_image(stored.clone()).await);

    // Cancel while queued.
    let queued = store
        .create(new_job(&stored, JobKind::DiseaseDetection), Utc::now())
        .await
        .unwrap();
    match store.cancel(&queued.id, Utc::now()).await.unwrap() {
        CancelOutcome::Cancelled { job, was_running } => {
            assert_eq!(job.state, JobState::Cancelled);
            assert!(!was_running);
        }
        other => panic!("unexpected cancel outcome: {other:?}"),
    }
    assert_eq!(
        store.cancel(&queued.id, Utc::now()).await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobState::Cancelled)
    );

    // A lease that runs out puts the job back in the queue.
    let job = store
        .create(new_job(&stored, JobKind::Comprehensive), Utc::now())
        .await
        .unwrap();
    store
        .claim(&job.id, "crashed-worker", Duration::from_secs(1), Utc::now())
        .await
        .unwrap()
        .expect("claimable");

    let later = Utc::now() + chrono::Duration::seconds(5);
    let recovery = store.requeue_expired_leases(3, later).await.unwrap();
    assert!(recovery.requeued >= 1);

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert!(job.lease_owner.is_none());
}

#[tokio::test]
#[ignore]
async fn test_expired_image_deletion_is_conditional() {
    let store = connect().await;
    let stored = image(chrono::Duration::seconds(-10));
    store.insert_image(stored.clone()).await.unwrap();

    // Referencing an expired image is refused.
    assert!(matches!(
        store
            .create(new_job(&stored, JobKind::PestDetection), Utc::now())
            .await,
        Err(StoreError::ImageExpired(_))
    ));

    let expired = store.expired_images(Utc::now(), 1000).await.unwrap();
    assert!(expired.iter().any(|i| i.image_ref == stored.image_ref));

    assert!(store
        .delete_expired_image(&stored.image_ref, Utc::now())
        .await
        .unwrap());
    assert!(store.get_image(&stored.image_ref).await.unwrap().is_none());
    assert!(!store
        .delete_expired_image(&stored.image_ref, Utc::now())
        .await
        .unwrap());
}

/// Sealed image blobs open only under the reference they were sealed for.
#[test]
fn test_image_sealing_roundtrip() {
    let key = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 32]);
    let encryption = EncryptionService::new(&key).expect("Failed to create encryption service");
    let image_ref = ImageRef::generate();

    let plaintext = b"leaf image with aphids";
    let sealed = encryption.seal(&image_ref, plaintext).expect("Sealing failed");
    let opened = encryption.open(&image_ref, &sealed).expect("Opening failed");

    assert_eq!(plaintext.as_slice(), opened.as_slice());
    assert_ne!(sealed, plaintext.to_vec());
    assert_err!(encryption.open(&ImageRef::generate(), &sealed));
}
