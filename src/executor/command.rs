//! Binds a stage to an external program.
//!
//! The program runs under `sh -c`. It receives `{"context": .., "inputs": [..]}`
//! as JSON on stdin and prints the output payload as JSON on stdout. Exit
//! status decides the outcome: 0 success, 65 rejection (Sanitize only),
//! 75 retryable, anything else fatal.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{sleep, timeout, Duration};

use super::{ExecutionResult, ExperimentContext, StageExecutor};
use crate::artifact::{Artifact, ArtifactPayload};
use crate::error::{PipelineError, Result};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::ExperimentId;
use crate::stage::StageKind;

pub const EXIT_REJECTED: i32 = 65;
pub const EXIT_RETRYABLE: i32 = 75;

const CANCEL_POLL: Duration = Duration::from_millis(100);
const DEFAULT_HALT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CommandExecutor {
    stage: StageKind,
    command: String,
    label: String,
    halt_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(stage: StageKind, command: String) -> Self {
        let label = format!("command:{command}");
        Self { stage, command, label, halt_timeout: DEFAULT_HALT_TIMEOUT }
    }

    pub fn with_halt_timeout(mut self, halt_timeout: Duration) -> Self {
        self.halt_timeout = halt_timeout;
        self
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command).env("PIPELINE_STAGE", self.stage.as_str());
        cmd
    }
}

fn trim_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() > 2000 {
        let mut cut = 2000;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    } else {
        text.to_string()
    }
}

/// Map a finished process to an outcome.
pub fn interpret_exit(stage: StageKind, code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> ExecutionResult {
    let diag = || {
        let err = trim_output(stderr);
        if err.is_empty() {
            trim_output(stdout)
        } else {
            err
        }
    };
    match code {
        Some(0) => match serde_json::from_slice::<ArtifactPayload>(stdout) {
            Ok(payload) => ExecutionResult::Success(payload),
            Err(e) => ExecutionResult::FatalFailure(format!("unparseable executor output: {e}")),
        },
        Some(EXIT_REJECTED) if stage == StageKind::Sanitize => ExecutionResult::Rejected {
            reason: diag(),
            suggested_fix: {
                let out = trim_output(stdout);
                (!out.is_empty()).then_some(out)
            },
        },
        Some(EXIT_RETRYABLE) => ExecutionResult::RetryableFailure(diag()),
        Some(code) => ExecutionResult::FatalFailure(format!("exit status {code}: {}", diag())),
        None => ExecutionResult::FatalFailure(format!("terminated by signal: {}", diag())),
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let request = json!({
            "context": {
                "experiment_id": ctx.experiment_id,
                "invocation_id": ctx.invocation_id,
                "stage": ctx.stage,
                "cycle": ctx.cycle,
                "attempt": ctx.attempt,
                "trigger": ctx.trigger,
                "manifest_ref": ctx.manifest_ref,
            },
            "inputs": inputs,
        });
        let body = request.to_string().into_bytes();

        let mut cmd = self.base_command();
        cmd.env("PIPELINE_EXPERIMENT_ID", ctx.experiment_id.as_str())
            .env("PIPELINE_INVOCATION_ID", ctx.invocation_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            // Spawn failures are environmental, not a property of the candidate.
            Err(e) => return ExecutionResult::RetryableFailure(format!("spawn {}: {e}", self.command)),
        };

        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // A program that ignores stdin closes the pipe early.
                let _ = stdin.write_all(&body).await;
                let _ = stdin.shutdown().await;
            }
        });
        let mut stdout = child.stdout.take();
        let stdout_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });
        let mut stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = sleep(CANCEL_POLL) => {
                    if ctx.is_cancelled() {
                        break None;
                    }
                }
            }
        };

        let Some(status) = status else {
            let _ = child.kill().await;
            writer.abort();
            return ExecutionResult::RetryableFailure("cancelled".to_string());
        };
        let _ = writer.await;
        let out = stdout_reader.await.unwrap_or_default();
        let err = stderr_reader.await.unwrap_or_default();

        match status {
            Ok(status) => {
                let result = interpret_exit(self.stage, status.code(), &out, &err);
                log(
                    Level::Debug,
                    Domain::Executor,
                    "command_finished",
                    obj(&[
                        ("invocation_id", v_str(ctx.invocation_id.as_str())),
                        ("stage", v_str(self.stage.as_str())),
                        ("exit", status.code().map(|c| json!(c)).unwrap_or_default()),
                    ]),
                );
                result
            }
            Err(e) => ExecutionResult::RetryableFailure(format!("wait {}: {e}", self.command)),
        }
    }

    /// Runs the program with `PIPELINE_ACTION=halt`; non-zero exit or
    /// running past the halt timeout is an error.
    async fn halt(&self, experiment: &ExperimentId) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.env("PIPELINE_ACTION", "halt")
            .env("PIPELINE_EXPERIMENT_ID", experiment.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = match timeout(self.halt_timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(PipelineError::FatalExecutorFailure(format!(
                    "halt for {experiment} timed out after {}ms",
                    self.halt_timeout.as_millis()
                )))
            }
        };
        if output.status.success() {
            Ok(())
        } else {
            Err(PipelineError::FatalExecutorFailure(format!(
                "halt for {experiment} exited with {:?}: {}",
                output.status.code(),
                trim_output(&output.stderr)
            )))
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}
