//! One-shot commands inside a running container
//!
//! Creates an exec instance, streams its output through a
//! [`LogStreamProcessor`], polls the daemon until the process exits, and
//! maps the exit code (plus any structured summary) to a result.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::PollPolicy;
use crate::docker::DockerOperations;
use crate::environment::ContainerEnvironment;
use crate::error::OrchestratorError;
use crate::log_stream::{ExecResult, LogStreamProcessor};
use crate::probe::PROGRESS_LOG_EVERY;

/// How long to wait for buffered output after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code: finished, but reported failures.
pub const EXIT_REPORTED_FAILURES: i64 = 1;
/// Exit code: the command rejected its configuration.
pub const EXIT_CONFIGURATION_ERROR: i64 = 2;

/// A command to run in an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInvocation {
    pub container_id: String,
    pub command: Vec<String>,
    pub env: ContainerEnvironment,
    pub user: Option<String>,
    pub poll: PollPolicy,
    /// Whether the command must print a structured summary line
    pub expect_summary: bool,
}

impl ExecInvocation {
    pub fn new(container_id: impl Into<String>, command: Vec<String>, poll: PollPolicy) -> Self {
        Self {
            container_id: container_id.into(),
            command,
            env: ContainerEnvironment::new(),
            user: None,
            poll,
            expect_summary: false,
        }
    }

    #[must_use]
    pub fn with_env(mut self, env: ContainerEnvironment) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn expecting_summary(mut self) -> Self {
        self.expect_summary = true;
        self
    }

    fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// Aborts the output reader if the runner bails out early.
struct OutputReader(Option<JoinHandle<LogStreamProcessor>>);

impl Drop for OutputReader {
    fn drop(&mut self) {
        if let Some(task) = &self.0 {
            task.abort();
        }
    }
}

/// Runs [`ExecInvocation`]s against the daemon.
pub struct ExecRunner {
    docker: Arc<dyn DockerOperations>,
}

impl ExecRunner {
    pub fn new(docker: Arc<dyn DockerOperations>) -> Self {
        Self { docker }
    }

    /// Run the command and apply the exit-code policy.
    pub async fn run(
        &self,
        invocation: &ExecInvocation,
        processor: LogStreamProcessor,
    ) -> Result<ExecResult> {
        let (exit_code, summary) = self.run_raw(invocation, processor).await?;
        classify_exit(exit_code, summary, invocation.expect_summary)
    }

    /// Run the command and return its exit code and parsed summary, if any.
    pub async fn run_raw(
        &self,
        invocation: &ExecInvocation,
        mut processor: LogStreamProcessor,
    ) -> Result<(i64, Option<ExecResult>)> {
        let command = invocation.display_command();
        info!(container = %invocation.container_id, command = %command, "exec");

        let exec = self
            .docker
            .create_exec(
                &invocation.container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    env: (!invocation.env.is_empty()).then(|| invocation.env.render()),
                    cmd: Some(invocation.command.clone()),
                    user: invocation.user.clone(),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;
        let exec_id = exec.id;

        let start_result = self
            .docker
            .start_exec(&exec_id, Some(StartExecOptions::default()))
            .await
            .context("Failed to start exec")?;

        let StartExecResults::Attached { mut output, .. } = start_result else {
            return Err(OrchestratorError::ExecutionFailure {
                exit_code: None,
                message: "exec should be attached but wasn't".to_owned(),
            }
            .into());
        };

        let mut reader = OutputReader(Some(tokio::spawn(async move {
            while let Some(frame) = output.next().await {
                match frame {
                    Ok(out) => processor.on_output(out),
                    Err(e) => {
                        warn!("exec output stream error: {e}");
                        break;
                    }
                }
            }
            processor.finish();
            processor
        })));

        let exit_code = self.wait_for_exit(&exec_id, &command, invocation.poll).await?;

        let summary = match reader.0.take() {
            Some(mut task) => match timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await {
                Ok(Ok(processor)) => processor.into_result(),
                Ok(Err(e)) => {
                    warn!("exec output reader failed: {e}");
                    None
                }
                Err(_) => {
                    warn!("exec output not drained within {OUTPUT_DRAIN_TIMEOUT:?}");
                    task.abort();
                    None
                }
            },
            None => None,
        };
        info!(command = %command, exit_code, "exec finished");
        Ok((exit_code, summary))
    }

    /// Poll exec inspection until the process exits or the budget runs out.
    async fn wait_for_exit(&self, exec_id: &str, command: &str, poll: PollPolicy) -> Result<i64> {
        let started = Instant::now();
        let mut polls: u32 = 0;
        loop {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .context("Failed to inspect exec")?;
            if inspect.running != Some(true) {
                return inspect.exit_code.ok_or_else(|| {
                    OrchestratorError::ExecutionFailure {
                        exit_code: None,
                        message: format!("'{command}' finished without an exit code"),
                    }
                    .into()
                });
            }

            polls = polls.saturating_add(1);
            let elapsed = started.elapsed();
            if elapsed >= poll.timeout() {
                return Err(OrchestratorError::Timeout {
                    operation: format!("'{command}'"),
                    limit: poll.timeout(),
                }
                .into());
            }
            if polls % PROGRESS_LOG_EVERY == 0 {
                info!(command, "still running after {}s", elapsed.as_secs());
            } else {
                debug!(command, polls, "still running");
            }
            sleep(poll.interval()).await;
        }
    }
}

/// Map an exit code and optional summary to success or a typed error.
///
/// - `0`: success, unless the summary reports failures or a required
///   summary never appeared
/// - `1`: the command ran but reported failures
/// - `2`: configuration error
/// - anything else: unknown failure
pub fn classify_exit(
    exit_code: i64,
    summary: Option<ExecResult>,
    expect_summary: bool,
) -> Result<ExecResult> {
    let details = summary.as_ref().map(|s| s.message.clone());
    match exit_code {
        0 => match summary {
            Some(result) if result.failure_count > 0 => Err(OrchestratorError::ExecutionFailure {
                exit_code: Some(0),
                message: format!(
                    "reported failures ({} succeeded, {} failed): {}",
                    result.success_count, result.failure_count, result.message
                ),
            }
            .into()),
            Some(result) => Ok(ExecResult {
                exit_code,
                ..result
            }),
            None if expect_summary => Err(OrchestratorError::ExecutionFailure {
                exit_code: Some(0),
                message: "did not finish correctly, no summary was reported".to_owned(),
            }
            .into()),
            None => Ok(ExecResult {
                exit_code,
                message: String::new(),
                success_count: 0,
                failure_count: 0,
            }),
        },
        EXIT_REPORTED_FAILURES => Err(OrchestratorError::ExecutionFailure {
            exit_code: Some(exit_code),
            message: details.map_or_else(
                || "reported failures".to_owned(),
                |d| format!("reported failures: {d}"),
            ),
        }
        .into()),
        EXIT_CONFIGURATION_ERROR => Err(OrchestratorError::config(
            "command rejected its configuration (exit 2)",
        )
        .into()),
        other => Err(OrchestratorError::ExecutionFailure {
            exit_code: Some(other),
            message: format!("unknown failure code {other}"),
        }
        .into()),
    }
}
