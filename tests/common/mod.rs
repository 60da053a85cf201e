//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

use veranode_prover::domain::{JobId, JobStatus, ModelEntry, NewModel, UserId};
use veranode_prover::engine::{
    CalibrationTarget, CancelToken, EngineError, EngineResult, ProvingEngine,
};
use veranode_prover::infra::{
    spawn_task_runner, ArtifactCache, RetryConfig, SqliteStore, TaskQueue, TaskRunner,
    TaskRunnerConfig,
};
use veranode_prover::metrics::MetricsRegistry;
use veranode_prover::pipeline::ProofPipeline;
use veranode_prover::service::{ModelRegistry, ProofService, ProofServiceConfig, SubmitProof};

/// Alice, the usual submitter
pub fn test_user() -> UserId {
    UserId::from_uuid(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap())
}

/// Bob, who should never see Alice's private things
pub fn other_user() -> UserId {
    UserId::from_uuid(Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap())
}

/// Settings as calibration leaves them: numbers encoded as strings
pub const RAW_SETTINGS: &str =
    r#"{"run_args":{"logrows":"17","input_scale":"7","tolerance":"0.5","check_mode":"true"},"model_output_scales":["7"]}"#;

fn write(path: &Path, body: &str) -> EngineResult<()> {
    fs::write(path, body).map_err(|e| EngineError::Failed(e.to_string()))
}

/// Engine that writes placeholder artifacts and counts every call.
///
/// Failures can be injected per stage: `transient_prove_failures` makes the
/// next N `prove` calls report the engine as unavailable, and
/// `compile_failure` makes every compilation fail permanently. `prove_delay_ms`
/// slows every proof down, and `hang_prove` blocks proving until the call is
/// cancelled.
#[derive(Default)]
pub struct FakeEngine {
    pub gen_settings_calls: AtomicUsize,
    pub calibrate_calls: AtomicUsize,
    pub compile_calls: AtomicUsize,
    pub srs_calls: AtomicUsize,
    pub setup_calls: AtomicUsize,
    pub witness_calls: AtomicUsize,
    pub prove_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub transient_prove_failures: AtomicU32,
    pub compile_failure: Mutex<Option<String>>,
    pub verify_unavailable: AtomicBool,
    pub proofs_invalid: AtomicBool,
    pub prove_delay_ms: AtomicU64,
    pub hang_prove: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_prove_transiently(&self, times: u32) {
        self.transient_prove_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_compile(&self, message: &str) {
        *self.compile_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn slow_prove(&self, delay: Duration) {
        self.prove_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn hang_prove(&self, hang: bool) {
        self.hang_prove.store(hang, Ordering::SeqCst);
    }

    pub fn setups(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn proves(&self) -> usize {
        self.prove_calls.load(Ordering::SeqCst)
    }
}

impl ProvingEngine for FakeEngine {
    fn gen_settings(&self, model: &Path, settings: &Path, _cancel: &CancelToken) -> EngineResult<()> {
        self.gen_settings_calls.fetch_add(1, Ordering::SeqCst);
        if !model.exists() {
            return Err(EngineError::Failed(format!("model not found: {}", model.display())));
        }
        write(settings, RAW_SETTINGS)
    }

    fn calibrate_settings(
        &self,
        input: &Path,
        _model: &Path,
        settings: &Path,
        _target: CalibrationTarget,
        _cancel: &CancelToken,
    ) -> EngineResult<()> {
        self.calibrate_calls.fetch_add(1, Ordering::SeqCst);
        if !input.exists() || !settings.exists() {
            return Err(EngineError::Failed("calibration inputs missing".into()));
        }
        Ok(())
    }

    fn compile_circuit(
        &self,
        _model: &Path,
        compiled: &Path,
        _settings: &Path,
        _cancel: &CancelToken,
    ) -> EngineResult<()> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.compile_failure.lock().unwrap().clone() {
            return Err(EngineError::Failed(message));
        }
        write(compiled, "compiled-circuit")
    }

    fn get_srs(&self, srs: &Path, _settings: &Path, _cancel: &CancelToken) -> EngineResult<()> {
        self.srs_calls.fetch_add(1, Ordering::SeqCst);
        write(srs, "srs")
    }

    fn setup(
        &self,
        _compiled: &Path,
        vk: &Path,
        pk: &Path,
        _srs: &Path,
        _cancel: &CancelToken,
    ) -> EngineResult<()> {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        write(vk, "verifying-key")?;
        write(pk, "proving-key")
    }

    fn gen_witness(
        &self,
        input: &Path,
        compiled: &Path,
        witness: &Path,
        _cancel: &CancelToken,
    ) -> EngineResult<()> {
        self.witness_calls.fetch_add(1, Ordering::SeqCst);
        if !input.exists() || !compiled.exists() {
            return Err(EngineError::Failed("witness inputs missing".into()));
        }
        write(witness, "witness")
    }

    fn prove(
        &self,
        witness: &Path,
        _compiled: &Path,
        pk: &Path,
        proof: &Path,
        _srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        self.prove_calls.fetch_add(1, Ordering::SeqCst);

        while self.hang_prove.load(Ordering::SeqCst) {
            if cancel.is_cancelled() {
                return Err(EngineError::Failed("prove cancelled".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let delay = self.prove_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        let pending = self.transient_prove_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_prove_failures
                .store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::Unavailable("prover process was killed".into()));
        }
        if !witness.exists() || !pk.exists() {
            return Err(EngineError::Failed("proving inputs missing".into()));
        }
        write(proof, r#"{"proof":"00ff"}"#)
    }

    fn verify(
        &self,
        proof: &Path,
        _settings: &Path,
        _vk: &Path,
        _srs: &Path,
        _cancel: &CancelToken,
    ) -> EngineResult<bool> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        if self.verify_unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("verifier unavailable".into()));
        }
        Ok(proof.exists() && !self.proofs_invalid.load(Ordering::SeqCst))
    }
}

/// Fresh in-memory database with the schema applied
pub async fn create_test_store() -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteStore::new(pool);
    store.initialize().await.unwrap();
    Arc::new(store)
}

/// Runner settings that retry quickly
pub fn fast_runner_config() -> TaskRunnerConfig {
    TaskRunnerConfig {
        worker_count: 2,
        hard_timeout: Duration::from_secs(30),
        soft_timeout: Duration::from_secs(30),
        retry: RetryConfig::proof_job()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(0.0),
        poll_interval: Duration::from_secs(3600),
    }
}

fn proof_service(
    proofs_dir: &Path,
    store: &Arc<SqliteStore>,
    engine: &Arc<FakeEngine>,
    queue: TaskQueue,
    metrics: &Arc<MetricsRegistry>,
) -> Arc<ProofService> {
    Arc::new(ProofService::new(
        ProofServiceConfig::new(proofs_dir),
        store.clone(),
        store.clone(),
        store.clone(),
        engine.clone(),
        queue,
        metrics.clone(),
    ))
}

/// Everything a test needs, wired the way the server wires it
pub struct TestApp {
    pub tmp: TempDir,
    pub store: Arc<SqliteStore>,
    pub engine: Arc<FakeEngine>,
    pub cache: Arc<ArtifactCache>,
    pub metrics: Arc<MetricsRegistry>,
    pub models: Arc<ModelRegistry>,
    pub proofs: Arc<ProofService>,
    pub queue: TaskQueue,
    shutdown: watch::Sender<bool>,
}

impl TestApp {
    /// App with a running task runner
    pub async fn start() -> Self {
        Self::start_with(fast_runner_config()).await
    }

    /// App with a running task runner using `config`
    pub async fn start_with(config: TaskRunnerConfig) -> Self {
        let mut app = Self::without_runner().await;
        app.queue = app.start_runner(config);
        app.proofs = app.proof_service(app.queue.clone());
        app
    }

    /// App whose jobs stay `PENDING` because nothing executes them
    pub async fn without_runner() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let proofs_dir = tmp.path().join("proofs");
        let models_dir = tmp.path().join("models");
        fs::create_dir_all(&proofs_dir).unwrap();
        fs::create_dir_all(&models_dir).unwrap();

        let store = create_test_store().await;
        let engine = Arc::new(FakeEngine::new());
        let cache = Arc::new(ArtifactCache::new(proofs_dir.join("_cache")));
        let metrics = Arc::new(MetricsRegistry::new());
        let (shutdown, _) = watch::channel(false);
        let queue = TaskQueue::detached();

        let models = Arc::new(ModelRegistry::new(
            store.clone(),
            &models_dir,
            metrics.clone(),
        ));
        let proofs = proof_service(&proofs_dir, &store, &engine, queue.clone(), &metrics);

        Self {
            tmp,
            store,
            engine,
            cache,
            metrics,
            models,
            proofs,
            queue,
            shutdown,
        }
    }

    fn proof_service(&self, queue: TaskQueue) -> Arc<ProofService> {
        proof_service(&self.proofs_dir(), &self.store, &self.engine, queue, &self.metrics)
    }

    /// Start a runner over this app's store, as a fresh process would on boot.
    ///
    /// Jobs submitted earlier through [`TestApp::proofs`] are only seen by
    /// the runner's recovery scan.
    pub fn start_runner(&self, config: TaskRunnerConfig) -> TaskQueue {
        let pipeline = Arc::new(ProofPipeline::new(self.engine.clone(), self.cache.clone()));
        let runner = TaskRunner::new(
            config,
            self.store.clone(),
            self.store.clone(),
            pipeline,
            self.metrics.clone(),
            self.shutdown.subscribe(),
        );
        let (_handle, queue) = spawn_task_runner(runner);
        queue
    }

    pub fn models_dir(&self) -> PathBuf {
        self.tmp.path().join("models")
    }

    pub fn proofs_dir(&self) -> PathBuf {
        self.tmp.path().join("proofs")
    }

    /// Write a model file and register it
    pub async fn register_model(&self, owner: UserId, name: &str, weights: &[u8]) -> ModelEntry {
        self.register_model_with(owner, name, weights, false).await
    }

    pub async fn register_model_with(
        &self,
        owner: UserId,
        name: &str,
        weights: &[u8],
        is_public: bool,
    ) -> ModelEntry {
        let file = format!("{name}.onnx");
        fs::write(self.models_dir().join(&file), weights).unwrap();
        self.models
            .register(owner, new_model(name, &file, is_public))
            .await
            .unwrap()
    }

    /// Submit a small input against `model`
    pub async fn submit(&self, user: UserId, model: &ModelEntry) -> JobId {
        self.proofs
            .submit(user, submit_request(model))
            .await
            .unwrap()
            .id
    }

    /// Poll until the job leaves `PENDING`/`PROCESSING`
    pub async fn wait_for_terminal(&self, user: UserId, job_id: JobId) -> JobStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.proofs.status(&job_id, &user).await.unwrap().status;
            if status.is_terminal() {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} still {status} after 10s"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until one of two jobs is `PROCESSING`; returns `(running, other)`
    pub async fn wait_for_first_processing(
        &self,
        user: UserId,
        a: JobId,
        b: JobId,
    ) -> (JobId, JobId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            for (running, other) in [(a, b), (b, a)] {
                let status = self.proofs.status(&running, &user).await.unwrap().status;
                if status == JobStatus::Processing {
                    return (running, other);
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "neither {a} nor {b} started within 10s"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Registration request for a file under the models directory
pub fn new_model(name: &str, file: &str, is_public: bool) -> NewModel {
    serde_json::from_value(json!({
        "name": name,
        "description": "integration test model",
        "format": "onnx",
        "source_path": file,
        "is_public": is_public,
    }))
    .unwrap()
}

pub fn submit_request(model: &ModelEntry) -> SubmitProof {
    SubmitProof {
        model_id: model.id,
        input_data: json!([[0.1, 0.2, 0.3]]),
        output_data: None,
    }
}

/// Deterministic weight bytes spanning several chunks
pub fn weights(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
