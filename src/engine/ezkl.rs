//! Engine binding that shells out to the `ezkl` command-line tool

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CalibrationTarget, CancelToken, EngineError, EngineResult, ProvingEngine};

/// How often a running child is checked for exit or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for [`EzklCli`]
#[derive(Debug, Clone)]
pub struct EzklCliConfig {
    /// Path or name of the `ezkl` executable
    pub binary: PathBuf,
    /// Proof type passed to `prove`
    pub proof_type: String,
}

impl Default for EzklCliConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ezkl"),
            proof_type: "single".to_string(),
        }
    }
}

impl EzklCliConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let binary = std::env::var("EZKL_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ezkl"));

        let proof_type =
            std::env::var("EZKL_PROOF_TYPE").unwrap_or_else(|_| "single".to_string());

        Self { binary, proof_type }
    }
}

/// Runs each engine operation as an `ezkl` subprocess
pub struct EzklCli {
    config: EzklCliConfig,
}

impl EzklCli {
    pub fn new(config: EzklCliConfig) -> Self {
        Self { config }
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg(subcommand);
        cmd
    }

    /// Run to completion and return the raw output, whatever the exit status.
    ///
    /// The child is killed as soon as `cancel` trips.
    fn output(
        &self,
        subcommand: &str,
        mut cmd: Command,
        cancel: &CancelToken,
    ) -> EngineResult<Output> {
        if cancel.is_cancelled() {
            return Err(cancelled(subcommand));
        }

        let start = Instant::now();
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.config.binary, e))?;

        // Drain both pipes so a chatty child never blocks on a full buffer
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if cancel.is_cancelled() => {
                    warn!(
                        subcommand,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "killing cancelled ezkl process"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(cancelled(subcommand));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineError::Unavailable(format!(
                        "failed to wait for ezkl {subcommand}: {e}"
                    )));
                }
            }
        };

        let output = Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        debug!(
            subcommand,
            status = ?output.status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "ezkl finished"
        );

        Ok(output)
    }

    fn run(&self, subcommand: &str, cmd: Command, cancel: &CancelToken) -> EngineResult<()> {
        let output = self.output(subcommand, cmd, cancel)?;
        if output.status.success() {
            return Ok(());
        }
        Err(failure_from_output(subcommand, &output))
    }
}

impl ProvingEngine for EzklCli {
    fn gen_settings(
        &self,
        model: &Path,
        settings: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut cmd = self.command("gen-settings");
        cmd.arg("-M").arg(model).arg("-O").arg(settings);
        self.run("gen-settings", cmd, cancel)
    }

    fn calibrate_settings(
        &self,
        input: &Path,
        model: &Path,
        settings: &Path,
        target: CalibrationTarget,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut cmd = self.command("calibrate-settings");
        cmd.arg("-D")
            .arg(input)
            .arg("-M")
            .arg(model)
            .arg("-O")
            .arg(settings)
            .arg("--target")
            .arg(target.as_str());
        self.run("calibrate-settings", cmd, cancel)
    }

    fn compile_circuit(
        &self,
        model: &Path,
        compiled: &Path,
        settings: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut cmd = self.command("compile-circuit");
        cmd.arg("-M")
            .arg(model)
            .arg("--compiled-circuit")
            .arg(compiled)
            .arg("-S")
            .arg(settings);
        self.run("compile-circuit", cmd, cancel)
    }

    fn get_srs(&self, srs: &Path, settings: &Path, cancel: &CancelToken) -> EngineResult<()> {
        let mut cmd = self.command("get-srs");
        cmd.arg("--srs-path").arg(srs).arg("-S").arg(settings);
        self.run("get-srs", cmd, cancel)
    }

    fn setup(
        &self,
        compiled: &Path,
        vk: &Path,
        pk: &Path,
        srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut cmd = self.command("setup");
        cmd.arg("-M")
            .arg(compiled)
            .arg("--vk-path")
            .arg(vk)
            .arg("--pk-path")
            .arg(pk)
            .arg("--srs-path")
            .arg(srs);
        self.run("setup", cmd, cancel)
    }

    fn gen_witness(
        &self,
        input: &Path,
        compiled: &Path,
        witness: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut cmd = self.command("gen-witness");
        cmd.arg("-D")
            .arg(input)
            .arg("-M")
            .arg(compiled)
            .arg("-O")
            .arg(witness);
        self.run("gen-witness", cmd, cancel)
    }

    fn prove(
        &self,
        witness: &Path,
        compiled: &Path,
        pk: &Path,
        proof: &Path,
        srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let mut cmd = self.command("prove");
        cmd.arg("-W")
            .arg(witness)
            .arg("-M")
            .arg(compiled)
            .arg("--pk-path")
            .arg(pk)
            .arg("--proof-path")
            .arg(proof)
            .arg("--srs-path")
            .arg(srs)
            .arg("--proof-type")
            .arg(&self.config.proof_type);
        self.run("prove", cmd, cancel)
    }

    fn verify(
        &self,
        proof: &Path,
        settings: &Path,
        vk: &Path,
        srs: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<bool> {
        let mut cmd = self.command("verify");
        cmd.arg("--proof-path")
            .arg(proof)
            .arg("-S")
            .arg(settings)
            .arg("--vk-path")
            .arg(vk)
            .arg("--srs-path")
            .arg(srs);
        let output = self.output("verify", cmd, cancel)?;
        interpret_verify(&output)
    }
}

fn cancelled(subcommand: &str) -> EngineError {
    EngineError::Failed(format!("ezkl {subcommand} cancelled"))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn spawn_error(binary: &Path, err: io::Error) -> EngineError {
    let message = format!("failed to run {}: {}", binary.display(), err);
    match err.kind() {
        // A missing or non-executable binary is a deployment problem
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => EngineError::Failed(message),
        _ => EngineError::Unavailable(message),
    }
}

fn failure_from_output(subcommand: &str, output: &Output) -> EngineError {
    let detail = last_meaningful_line(&output.stderr)
        .or_else(|| last_meaningful_line(&output.stdout))
        .unwrap_or_else(|| format!("ezkl {subcommand} exited with {}", output.status));

    match output.status.code() {
        Some(_) => EngineError::Failed(detail),
        // Killed by a signal: the engine was interrupted rather than rejecting the input
        None => {
            warn!(subcommand, "ezkl terminated by signal");
            EngineError::Unavailable(detail)
        }
    }
}

fn last_meaningful_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

/// `ezkl verify` reports `verified: true|false`. A rejected proof may also
/// surface as a non-zero exit whose output says verification failed.
fn interpret_verify(output: &Output) -> EngineResult<bool> {
    let text = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
    .to_ascii_lowercase();

    if let Some(verdict) = parse_verdict(&text) {
        return Ok(verdict);
    }

    if output.status.success() {
        return Ok(true);
    }

    if text.contains("verification failed") || text.contains("invalid proof") {
        return Ok(false);
    }

    Err(failure_from_output("verify", output))
}

fn parse_verdict(text: &str) -> Option<bool> {
    text.lines().rev().find_map(|line| {
        let (_, rest) = line.split_once("verified:")?;
        match rest.trim() {
            v if v.starts_with("true") => Some(true),
            v if v.starts_with("false") => Some(false),
            _ => None,
        }
    })
}
