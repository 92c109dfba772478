//! Stage capability interface
//!
//! A stage's actual computation lives behind [`Capability`]: the
//! orchestrator hands over named input artifacts, the invocation context
//! (weights, suppression set, directives), and a bounded budget, and gets
//! back exactly one output payload or a failure. Any implementation — a
//! model call, a script, a human-in-the-loop step — satisfies the contract.
//!
//! The shipped implementation spawns the stage's configured command as a
//! subprocess: inputs and context arrive through `CADENCE_*` environment
//! variables, the artifact payload is the subprocess stdout, and stderr is
//! streamed to the terminal and preserved on disk for post-mortem.

use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as TokioCommand;

use crate::error::{OrchestratorError, Result};

/// Everything a capability invocation receives from the orchestrator.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Name of the stage being executed
    pub stage: String,
    /// Cycle number of this run
    pub cycle: u64,
    /// Run date of this run
    pub date: NaiveDate,
    /// Command to spawn: program followed by arguments
    pub command: Vec<String>,
    /// Named input artifacts, as (stage-name, path) pairs
    pub inputs: Vec<(String, PathBuf)>,
    /// Path to the context file (weights, suppression set, directives)
    pub context_path: PathBuf,
    /// Path the stage may write next-cycle directives to
    pub directives_path: PathBuf,
    /// Maximum external invocation turns
    pub max_turns: u32,
    /// Wall-clock budget; exceeding it is a stage failure
    pub timeout: Duration,
    /// Where the invocation's stderr log is preserved
    pub log_path: PathBuf,
}

/// Result of a successful capability invocation.
#[derive(Debug)]
pub struct InvocationOutput {
    /// The produced artifact payload (subprocess stdout)
    pub payload: Vec<u8>,
    /// Wall-clock duration of the invocation in seconds
    pub duration_secs: u64,
}

/// A bounded, fallible external transformation implementing one stage.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Perform the stage's computation within the request's budget.
    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput>;
}

/// Capability that runs the stage's configured command as a subprocess.
#[derive(Debug, Default)]
pub struct CommandCapability;

impl CommandCapability {
    /// Create a new subprocess-backed capability.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Build the subprocess command with the request's environment contract.
fn build_command(request: &InvocationRequest) -> TokioCommand {
    let mut cmd = TokioCommand::new(&request.command[0]);
    cmd.args(&request.command[1..]);
    cmd.env("CADENCE_STAGE", &request.stage);
    cmd.env("CADENCE_CYCLE", request.cycle.to_string());
    cmd.env("CADENCE_DATE", request.date.to_string());
    cmd.env("CADENCE_MAX_TURNS", request.max_turns.to_string());
    cmd.env("CADENCE_CONTEXT", &request.context_path);
    cmd.env("CADENCE_DIRECTIVES", &request.directives_path);
    for (name, path) in &request.inputs {
        cmd.env(
            format!("CADENCE_INPUT_{}", name.to_uppercase().replace('-', "_")),
            path,
        );
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd
}

#[async_trait]
impl Capability for CommandCapability {
    async fn invoke(&self, request: &InvocationRequest) -> Result<InvocationOutput> {
        let stage = request.stage.clone();
        let fail = |reason: String| OrchestratorError::StageFailure {
            stage: stage.clone(),
            reason,
        };

        if let Some(dir) = request.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut log_file = std::fs::File::create(&request.log_path)?;

        let start = Instant::now();
        let mut child = build_command(request)
            .spawn()
            .map_err(|e| fail(format!("failed to spawn '{}': {e}", request.command[0])))?;

        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| fail("failed to capture stdout".to_string()))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| fail("failed to capture stderr".to_string()))?;

        // stdout is the artifact payload; read it whole
        let stdout_handle = tokio::spawn(async move {
            let mut payload = Vec::new();
            let _ = child_stdout.read_to_end(&mut payload).await;
            payload
        });

        // stderr is diagnostics; stream to terminal and the on-disk log
        let stage_label = request.stage.clone();
        let stderr_handle = tokio::spawn(async move {
            let reader = BufReader::new(child_stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("  [{stage_label}] {line}");
                let _ = writeln!(log_file, "{line}");
            }
        });

        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(res) => res.map_err(|e| fail(format!("failed waiting for process: {e}")))?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(fail(format!(
                    "exceeded budget of {}s, killed",
                    request.timeout.as_secs()
                )));
            }
        };

        let payload = stdout_handle
            .await
            .map_err(|e| fail(format!("stdout reader panicked: {e}")))?;
        stderr_handle
            .await
            .map_err(|e| fail(format!("stderr reader panicked: {e}")))?;

        if !status.success() {
            return Err(fail(match status.code() {
                Some(code) => format!("exited with code {code}"),
                None => "killed by signal".to_string(),
            }));
        }

        Ok(InvocationOutput {
            payload,
            duration_secs: start.elapsed().as_secs(),
        })
    }
}
