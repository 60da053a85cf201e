//! End-to-end tests of submission, background proving, caching and verification.
//!
//! Each test runs against an in-memory SQLite database and a fake engine that
//! writes placeholder artifacts, so the whole job lifecycle runs in-process.

mod common;

use std::fs;
use std::time::Duration;

use serde_json::Value;
use veranode_prover::crypto::canonical_json_hash;
use veranode_prover::domain::{AttemptStart, JobStatus, Page};
use veranode_prover::infra::{ErrorKind, JobStore, ProverError, TaskRunnerConfig};
use veranode_prover::metrics::metric_names;

use common::*;

// ============================================================================
// Proof generation
// ============================================================================

#[tokio::test]
async fn test_first_job_runs_setup_and_second_hits_cache() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "mnist", &weights(1, 4096)).await;

    let first = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, first).await, JobStatus::Completed);

    let job = app.proofs.job(&first, &alice).await.unwrap();
    assert!(!job.cache_hit);
    assert!(job.proof_available());
    assert_eq!(app.engine.setups(), 1);

    let cached = app.cache.lookup(&model.fingerprint).unwrap();
    assert!(cached.is_some(), "setup artifacts should be cached after the first job");

    let second = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, second).await, JobStatus::Completed);

    let job = app.proofs.job(&second, &alice).await.unwrap();
    assert!(job.cache_hit);
    assert_eq!(app.engine.setups(), 1, "cache hit must skip setup");
    assert_eq!(app.engine.proves(), 2);

    // Both jobs own a full set of artifacts in their own directories
    for path in [
        job.artifacts.proof.as_ref().unwrap(),
        job.artifacts.verifying_key.as_ref().unwrap(),
        job.artifacts.settings.as_ref().unwrap(),
    ] {
        assert!(path.exists(), "{} missing", path.display());
        assert!(path.starts_with(app.proofs_dir().join(second.to_string())));
    }

    assert_eq!(app.metrics.get_counter(metric_names::CACHE_HITS).await, 1);
    assert_eq!(app.metrics.get_counter(metric_names::CACHE_MISSES).await, 1);
}

#[tokio::test]
async fn test_settings_are_normalized_before_compilation() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "normalize", &weights(2, 512)).await;

    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);

    let job = app.proofs.job(&id, &alice).await.unwrap();
    let raw = fs::read_to_string(job.artifacts.settings.unwrap()).unwrap();
    let settings: Value = serde_json::from_str(&raw).unwrap();

    assert_eq!(settings["run_args"]["logrows"], 17);
    assert_eq!(settings["run_args"]["tolerance"], 0.5);
    assert_eq!(settings["run_args"]["check_mode"], true);
    assert_eq!(settings["model_output_scales"][0], 7);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "flaky", &weights(3, 1024)).await;
    app.engine.fail_prove_transiently(1);

    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);

    assert_eq!(app.engine.proves(), 2);
    assert_eq!(app.metrics.get_counter(metric_names::JOBS_RETRIED).await, 1);

    let job = app.proofs.job(&id, &alice).await.unwrap();
    assert!(job.error_message.is_none());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "loops", &weights(4, 1024)).await;
    app.engine.fail_compile("unsupported op: Loop");

    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Failed);

    let status = app.proofs.status(&id, &alice).await.unwrap();
    assert!(!status.proof_available);
    assert!(status
        .error_message
        .as_deref()
        .unwrap()
        .contains("unsupported op: Loop"));

    assert_eq!(
        app.engine
            .compile_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(app.engine.proves(), 0);
    assert!(app.cache.lookup(&model.fingerprint).unwrap().is_none());
}

#[tokio::test]
async fn test_finished_job_is_not_run_again() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "once", &weights(5, 256)).await;

    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);
    let before = app.proofs.job(&id, &alice).await.unwrap();

    assert_eq!(
        app.store.begin_attempt(&id, "late-task").await.unwrap(),
        AttemptStart::AlreadyCompleted
    );

    app.queue.enqueue(id);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let after = app.proofs.job(&id, &alice).await.unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.task_id, before.task_id);
    assert_eq!(after.completed_at, before.completed_at);
    assert_eq!(app.engine.proves(), 1);
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "always-flaky", &weights(14, 1024)).await;
    app.engine.fail_prove_transiently(3);

    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Failed);

    assert_eq!(app.engine.proves(), 3);
    assert_eq!(app.metrics.get_counter(metric_names::JOBS_RETRIED).await, 2);

    let job = app.proofs.job(&id, &alice).await.unwrap();
    let message = job.error_message.unwrap();
    assert!(message.contains("prover process was killed"), "{message}");
    assert!(!message.starts_with("Retry"), "{message}");
}

#[tokio::test]
async fn test_queued_job_waits_for_a_worker_slot() {
    let app = TestApp::start_with(TaskRunnerConfig {
        worker_count: 1,
        soft_timeout: Duration::from_millis(500),
        ..fast_runner_config()
    })
    .await;
    let alice = test_user();
    let model = app.register_model(alice, "queued", &weights(15, 512)).await;
    app.engine.slow_prove(Duration::from_millis(800));

    let a = app.submit(alice, &model).await;
    let b = app.submit(alice, &model).await;

    // Whichever job got the slot first, the other has not started
    let (running, waiting) = app.wait_for_first_processing(alice, a, b).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = app.proofs.job(&waiting, &alice).await.unwrap();
    assert_eq!(queued.status, JobStatus::Pending);
    assert!(queued.started_at.is_none());

    // Waiting in the queue does not count against the time limits
    assert_eq!(app.wait_for_terminal(alice, running).await, JobStatus::Completed);
    assert_eq!(app.wait_for_terminal(alice, waiting).await, JobStatus::Completed);

    let first = app.proofs.job(&running, &alice).await.unwrap();
    let second = app.proofs.job(&waiting, &alice).await.unwrap();
    assert!(second.error_message.is_none());
    // The second job could not start until the first one's 800ms proof was done
    let gap = second.started_at.unwrap() - first.started_at.unwrap();
    assert!(gap >= chrono::Duration::milliseconds(800), "started {gap} apart");
}

#[tokio::test]
async fn test_hard_timeout_fails_job_and_frees_the_slot() {
    let app = TestApp::start_with(TaskRunnerConfig {
        worker_count: 1,
        hard_timeout: Duration::from_millis(300),
        ..fast_runner_config()
    })
    .await;
    let alice = test_user();
    let model = app.register_model(alice, "hangs", &weights(16, 512)).await;
    app.engine.hang_prove(true);

    let stuck = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, stuck).await, JobStatus::Failed);

    let job = app.proofs.job(&stuck, &alice).await.unwrap();
    let message = job.error_message.unwrap();
    assert!(message.contains("hard time limit"), "{message}");
    assert_eq!(app.engine.proves(), 1, "a timed-out job is not retried");
    assert_eq!(app.metrics.get_counter(metric_names::JOBS_TIMED_OUT).await, 1);

    // The only worker slot was released when the hung call was cancelled
    app.engine.hang_prove(false);
    let next = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, next).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_interrupted_job_is_recovered_on_startup() {
    let app = TestApp::without_runner().await;
    let alice = test_user();
    let model = app.register_model(alice, "crashed", &weights(17, 512)).await;
    let id = app.submit(alice, &model).await;

    // A worker picked the job up and then the process died
    assert_eq!(
        app.store.begin_attempt(&id, "lost-worker").await.unwrap(),
        AttemptStart::Started
    );
    let interrupted = app.proofs.job(&id, &alice).await.unwrap();
    assert_eq!(interrupted.status, JobStatus::Processing);

    app.start_runner(fast_runner_config());
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);

    let job = app.proofs.job(&id, &alice).await.unwrap();
    assert_eq!(job.started_at, interrupted.started_at);
    assert_ne!(job.task_id.as_deref(), Some("lost-worker"));
    assert_eq!(app.engine.proves(), 1);
    assert_eq!(app.metrics.get_counter(metric_names::JOBS_RECOVERED).await, 1);
}

#[tokio::test]
async fn test_missing_model_file_fails_even_on_cache_hit() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "deleted", &weights(18, 512)).await;

    let first = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, first).await, JobStatus::Completed);
    assert!(app.cache.lookup(&model.fingerprint).unwrap().is_some());

    fs::remove_file(&model.storage_path).unwrap();

    let second = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, second).await, JobStatus::Failed);

    let status = app.proofs.status(&second, &alice).await.unwrap();
    assert!(status
        .error_message
        .as_deref()
        .unwrap()
        .contains("model file not found"));
    assert_eq!(app.engine.proves(), 1);
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_submission_writes_input_and_hashes_canonical_form() {
    let app = TestApp::without_runner().await;
    let alice = test_user();
    let model = app.register_model(alice, "hashing", &weights(6, 128)).await;

    let job = app
        .proofs
        .submit(alice, submit_request(&model))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.input_path, app.proofs_dir().join(job.id.to_string()).join("input.json"));

    let written: Value = serde_json::from_slice(&fs::read(&job.input_path).unwrap()).unwrap();
    assert_eq!(written["input_data"], serde_json::json!([[0.1, 0.2, 0.3]]));
    assert!(written.get("output_data").is_none());
    assert_eq!(job.input_hash, canonical_json_hash(&written).unwrap());
}

#[tokio::test]
async fn test_eleventh_active_job_is_rejected() {
    let app = TestApp::without_runner().await;
    let alice = test_user();
    let model = app.register_model(alice, "quota", &weights(7, 128)).await;

    for _ in 0..10 {
        app.submit(alice, &model).await;
    }

    let err = app
        .proofs
        .submit(alice, submit_request(&model))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProverError::QuotaExceeded {
            active: 10,
            limit: 10
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Quota);

    let jobs = app.proofs.list(&alice, Page::new(None, Some(100))).await.unwrap();
    assert_eq!(jobs.total, 10);

    // Only the accepted jobs left directories behind
    let dirs = fs::read_dir(app.proofs_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "_cache")
        .count();
    assert_eq!(dirs, 10);

    // Another user is unaffected
    let public = app
        .register_model_with(alice, "quota-public", &weights(8, 128), true)
        .await;
    app.submit(other_user(), &public).await;
}

#[tokio::test]
async fn test_private_model_cannot_be_used_by_others() {
    let app = TestApp::without_runner().await;
    let model = app.register_model(test_user(), "private", &weights(9, 128)).await;

    let err = app
        .proofs
        .submit(other_user(), submit_request(&model))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn test_verifying_pending_job_is_rejected() {
    let app = TestApp::without_runner().await;
    let alice = test_user();
    let model = app.register_model(alice, "pending", &weights(10, 128)).await;
    let id = app.submit(alice, &model).await;

    let err = app.proofs.verify(&id, &alice).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("PENDING"));
    assert!(app.proofs.verifications(&id, &alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_each_verification_is_recorded() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "verify", &weights(11, 512)).await;
    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);

    let first = app.proofs.verify(&id, &alice).await.unwrap();
    assert!(first.is_valid);

    app.engine
        .proofs_invalid
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let second = app.proofs.verify(&id, &alice).await.unwrap();
    assert!(!second.is_valid);

    let history = app.proofs.verifications(&id, &alice).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[1].id, second.id);
    assert!(history.iter().all(|r| r.job_id == id && r.model_id == model.id));

    assert_eq!(app.metrics.get_counter(metric_names::VERIFICATIONS_VALID).await, 1);
    assert_eq!(app.metrics.get_counter(metric_names::VERIFICATIONS_INVALID).await, 1);
}

#[tokio::test]
async fn test_engine_error_during_verification_records_nothing() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app.register_model(alice, "verify-down", &weights(12, 512)).await;
    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);

    app.engine
        .verify_unavailable
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = app.proofs.verify(&id, &alice).await.unwrap_err();
    assert!(matches!(err, ProverError::Engine(_)));
    assert!(app.proofs.verifications(&id, &alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_public_model_proofs_can_be_verified_by_anyone() {
    let app = TestApp::start().await;
    let alice = test_user();
    let model = app
        .register_model_with(alice, "shared", &weights(13, 512), true)
        .await;
    let id = app.submit(alice, &model).await;
    assert_eq!(app.wait_for_terminal(alice, id).await, JobStatus::Completed);

    let record = app.proofs.verify(&id, &other_user()).await.unwrap();
    assert_eq!(record.verifier, other_user());

    // The job itself stays private to its submitter
    let err = app.proofs.job(&id, &other_user()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
}
