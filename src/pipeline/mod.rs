//! The proving pipeline
//!
//! Turns a registered model plus one input into a proof by running the
//! engine's stages in a fixed order. The six setup stages depend only on the
//! model, so their outputs are shared through the [`ArtifactCache`] and
//! skipped when a complete cached set exists.
//!
//! The pipeline is synchronous. Callers run it on a blocking thread.

mod settings;

pub use settings::{coerce_string, normalize_settings, normalize_settings_file};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::{ArtifactPaths, JobId, JobLayout};
use crate::engine::{CalibrationTarget, CancelToken, EngineError, EngineResult, ProvingEngine};
use crate::infra::{ArtifactCache, ProverError, Result};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    GenSettings,
    Calibrate,
    NormalizeSettings,
    CompileCircuit,
    GetSrs,
    Setup,
    GenWitness,
    Prove,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::GenSettings,
        Stage::Calibrate,
        Stage::NormalizeSettings,
        Stage::CompileCircuit,
        Stage::GetSrs,
        Stage::Setup,
        Stage::GenWitness,
        Stage::Prove,
    ];

    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GenSettings => "gen_settings",
            Stage::Calibrate => "calibrate",
            Stage::NormalizeSettings => "normalize_settings",
            Stage::CompileCircuit => "compile_circuit",
            Stage::GetSrs => "get_srs",
            Stage::Setup => "setup",
            Stage::GenWitness => "gen_witness",
            Stage::Prove => "prove",
        }
    }

    /// True for stages replaced by a cache hit
    pub fn is_setup(&self) -> bool {
        !matches!(self, Stage::GenWitness | Stage::Prove)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::GenSettings => "settings generation",
            Stage::Calibrate => "settings calibration",
            Stage::NormalizeSettings => "settings normalization",
            Stage::CompileCircuit => "circuit compilation",
            Stage::GetSrs => "reference string acquisition",
            Stage::Setup => "key setup",
            Stage::GenWitness => "witness generation",
            Stage::Prove => "proving",
        };
        f.write_str(s)
    }
}

/// Soft time limit and cancellation flag.
///
/// The soft limit is checked between stages only. Cancellation is also
/// handed to every engine call, which stops the running stage.
#[derive(Debug, Clone)]
pub struct StageDeadline {
    soft_deadline: Option<Instant>,
    cancel: CancelToken,
}

impl StageDeadline {
    pub fn new(soft_limit: Option<Duration>) -> Self {
        Self {
            soft_deadline: soft_limit.map(|limit| Instant::now() + limit),
            cancel: CancelToken::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Stop the running engine call and every later stage
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn check(&self, next: Stage) -> Result<()> {
        if self.is_cancelled() {
            return Err(ProverError::Timeout(format!("cancelled before {next}")));
        }
        if let Some(deadline) = self.soft_deadline {
            if Instant::now() >= deadline {
                return Err(ProverError::Timeout(format!(
                    "soft time limit exceeded before {next}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for StageDeadline {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Everything one pipeline run needs to know about its job
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub job_id: JobId,
    pub model_path: PathBuf,
    pub model_fingerprint: String,
    pub layout: JobLayout,
    pub deadline: StageDeadline,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub artifacts: ArtifactPaths,
    pub cache_hit: bool,
    pub stage_timings: Vec<StageTiming>,
}

/// Runs the proving stages for one job at a time
pub struct ProofPipeline {
    engine: Arc<dyn ProvingEngine>,
    cache: Arc<ArtifactCache>,
}

impl ProofPipeline {
    pub fn new(engine: Arc<dyn ProvingEngine>, cache: Arc<ArtifactCache>) -> Self {
        Self { engine, cache }
    }

    /// Run every stage for `ctx`, stopping at the first failure
    pub fn run(&self, ctx: &PipelineContext) -> Result<PipelineOutput> {
        let layout = &ctx.layout;
        std::fs::create_dir_all(layout.dir())?;

        let mut timings = Vec::with_capacity(Stage::ALL.len());
        let cache_hit = self.restore_from_cache(ctx);

        if !cache_hit {
            self.run_setup(ctx, &mut timings)?;

            if let Err(e) = self.cache.populate(&ctx.model_fingerprint, layout.dir()) {
                warn!(
                    job_id = %ctx.job_id,
                    fingerprint = %ctx.model_fingerprint,
                    error = %e,
                    "failed to populate artifact cache"
                );
            }
        }

        let compiled = layout.compiled_circuit();
        let witness = layout.witness();
        let cancel = ctx.deadline.token();

        run_stage(Stage::GenWitness, ctx, &mut timings, || {
            self.engine
                .gen_witness(&layout.input(), &compiled, &witness, cancel)
        })?;

        run_stage(Stage::Prove, ctx, &mut timings, || {
            self.engine.prove(
                &witness,
                &compiled,
                &layout.proving_key(),
                &layout.proof(),
                &layout.srs(),
                cancel,
            )
        })?;

        info!(
            job_id = %ctx.job_id,
            cache_hit,
            total_ms = timings.iter().map(|t| t.elapsed.as_millis() as u64).sum::<u64>(),
            "proof generated"
        );

        Ok(PipelineOutput {
            artifacts: layout.artifact_paths(),
            cache_hit,
            stage_timings: timings,
        })
    }

    /// Copy a cached setup into the job directory. Any cache problem falls back to a fresh setup.
    fn restore_from_cache(&self, ctx: &PipelineContext) -> bool {
        let set = match self.cache.lookup(&ctx.model_fingerprint) {
            Ok(Some(set)) => set,
            Ok(None) => return false,
            Err(e) => {
                warn!(job_id = %ctx.job_id, error = %e, "artifact cache lookup failed");
                return false;
            }
        };

        match self.cache.restore(&set, ctx.layout.dir()) {
            Ok(()) => {
                debug!(job_id = %ctx.job_id, "setup stages skipped, artifacts restored from cache");
                true
            }
            Err(e) => {
                warn!(job_id = %ctx.job_id, error = %e, "artifact cache restore failed");
                false
            }
        }
    }

    fn run_setup(&self, ctx: &PipelineContext, timings: &mut Vec<StageTiming>) -> Result<()> {
        let layout = &ctx.layout;
        let model = ctx.model_path.as_path();
        let settings = layout.settings();
        let compiled = layout.compiled_circuit();
        let srs = layout.srs();
        let cancel = ctx.deadline.token();

        run_stage(Stage::GenSettings, ctx, timings, || {
            self.engine.gen_settings(model, &settings, cancel)
        })?;

        run_stage(Stage::Calibrate, ctx, timings, || {
            self.engine.calibrate_settings(
                &layout.input(),
                model,
                &settings,
                CalibrationTarget::Resources,
                cancel,
            )
        })?;

        run_stage(Stage::NormalizeSettings, ctx, timings, || {
            normalize_settings_file(&settings).map_err(|e| EngineError::Failed(e.to_string()))
        })?;

        run_stage(Stage::CompileCircuit, ctx, timings, || {
            self.engine
                .compile_circuit(model, &compiled, &settings, cancel)
        })?;

        run_stage(Stage::GetSrs, ctx, timings, || {
            self.engine.get_srs(&srs, &settings, cancel)
        })?;

        run_stage(Stage::Setup, ctx, timings, || {
            self.engine.setup(
                &compiled,
                &layout.verifying_key(),
                &layout.proving_key(),
                &srs,
                cancel,
            )
        })
    }
}

fn run_stage<F>(
    stage: Stage,
    ctx: &PipelineContext,
    timings: &mut Vec<StageTiming>,
    op: F,
) -> Result<()>
where
    F: FnOnce() -> EngineResult<()>,
{
    ctx.deadline.check(stage)?;

    debug!(job_id = %ctx.job_id, stage = stage.as_str(), "stage started");
    let start = Instant::now();
    let result = op();
    let elapsed = start.elapsed();
    timings.push(StageTiming { stage, elapsed });

    match result {
        Ok(()) => {
            debug!(
                job_id = %ctx.job_id,
                stage = stage.as_str(),
                duration_ms = elapsed.as_millis() as u64,
                "stage finished"
            );
            Ok(())
        }
        Err(e) => {
            warn!(job_id = %ctx.job_id, stage = stage.as_str(), error = %e, "stage failed");
            Err(ProverError::stage(stage, e))
        }
    }
}
