//! In-memory Docker daemon for integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use bollard::container::{Config, LogOutput};
use bollard::exec::{CreateExecOptions, CreateExecResults, StartExecOptions, StartExecResults};
use bollard::service::{ContainerCreateResponse, ContainerSummary, ExecInspectResponse, ImageSummary};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use icm_docker::docker::DockerOperations;
use icm_docker::OrchestratorError;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

/// Scripted behavior of the next exec.
#[derive(Debug, Clone, Default)]
pub struct FakeExec {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i64,
    /// Inspections reporting "running" before exit; `None` runs forever
    pub running_polls: Option<u32>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub containers: Vec<FakeContainer>,
    pub images: Vec<String>,
    pub pulls: Vec<String>,
    pub created: Vec<(String, Config<String>)>,
    pub start_calls: u32,
    pub stop_calls: u32,
    pub remove_calls: u32,
    /// Upcoming remove calls answered with 409
    pub remove_conflicts: u32,
    /// Conflicts armed after a successful remove (another agent still busy)
    pub conflicts_after_remove: u32,
    /// Status forced on every stop
    pub stop_status: Option<u16>,
    pub log_lines: Vec<String>,
    /// Keep the log stream open after the scripted lines
    pub log_follow: bool,
    pub exec: FakeExec,
    pub exec_commands: Vec<Vec<String>>,
    pub exec_env: Vec<Vec<String>>,
    pub inspect_calls: u32,
    next_id: u32,
}

#[derive(Clone, Default)]
pub struct FakeDocker {
    pub state: Arc<Mutex<FakeState>>,
    /// Set once a log stream handed out by `logs` has been dropped
    pub log_stream_dropped: Arc<AtomicBool>,
}

pub fn daemon_error(operation: &str, status: u16) -> anyhow::Error {
    OrchestratorError::Docker {
        operation: operation.to_owned(),
        status: Some(status),
        message: format!("fake daemon answered {status}"),
    }
    .into()
}

impl FakeDocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn with_container(self, id: &str, name: &str, image: &str, running: bool) -> Self {
        self.state().containers.push(FakeContainer {
            id: id.to_owned(),
            name: name.to_owned(),
            image: image.to_owned(),
            running,
        });
        self
    }

    pub fn with_image(self, image: &str) -> Self {
        self.state().images.push(image.to_owned());
        self
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state().containers.iter().find(|c| c.name == name).cloned()
    }

    pub fn log_stream_was_dropped(&self) -> bool {
        self.log_stream_dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn frames(lines: &[String], stderr: bool) -> Vec<LogOutput> {
    lines
        .iter()
        .map(|line| {
            let message = format!("{line}\n").into();
            if stderr {
                LogOutput::StdErr { message }
            } else {
                LogOutput::StdOut { message }
            }
        })
        .collect()
}

#[async_trait]
impl DockerOperations for FakeDocker {
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        // Same substring semantics as the daemon's name filter
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|c| c.name.contains(name))
            .map(|c| ContainerSummary {
                id: Some(c.id.clone()),
                names: Some(vec![format!("/{}", c.name)]),
                image: Some(c.image.clone()),
                state: Some(if c.running { "running" } else { "exited" }.to_owned()),
                ..Default::default()
            })
            .collect())
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse> {
        let mut state = self.state();
        if state.containers.iter().any(|c| c.name == name) {
            return Err(daemon_error("create_container", 409));
        }
        state.next_id += 1;
        let id = format!("fake{:04}", state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_owned(),
            image: config.image.clone().unwrap_or_default(),
            running: false,
        });
        state.created.push((name.to_owned(), config));
        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.start_calls += 1;
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
            .ok_or_else(|| daemon_error("start_container", 404))?;
        if container.running {
            return Err(daemon_error("start_container", 304));
        }
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<()> {
        let mut state = self.state();
        state.stop_calls += 1;
        if let Some(status) = state.stop_status {
            return Err(daemon_error("stop_container", status));
        }
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
            .ok_or_else(|| daemon_error("stop_container", 404))?;
        if !container.running {
            return Err(daemon_error("stop_container", 304));
        }
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.remove_calls += 1;
        if state.remove_conflicts > 0 {
            state.remove_conflicts -= 1;
            return Err(daemon_error("remove_container", 409));
        }
        let before = state.containers.len();
        state.containers.retain(|c| c.id != id && c.name != id);
        if state.containers.len() == before {
            return Err(daemon_error("remove_container", 404));
        }
        state.remove_conflicts = state.conflicts_after_remove;
        Ok(())
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>> {
        Ok(self
            .state()
            .images
            .iter()
            .filter(|i| *i == reference)
            .map(|i| ImageSummary {
                id: format!("sha256:{i}"),
                repo_tags: vec![i.clone()],
                ..Default::default()
            })
            .collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut state = self.state();
        state.pulls.push(reference.to_owned());
        state.images.push(reference.to_owned());
        Ok(())
    }

    fn logs(&self, _id: &str) -> BoxStream<'static, Result<LogOutput>> {
        let state = self.state();
        let flag = DropFlag(Arc::clone(&self.log_stream_dropped));
        let scripted =
            stream::iter(frames(&state.log_lines, false).into_iter().map(Ok::<_, anyhow::Error>));
        let tail: BoxStream<'static, Result<LogOutput>> = if state.log_follow {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        scripted
            .chain(tail)
            .map(move |frame| {
                let _keep = &flag;
                frame
            })
            .boxed()
    }

    async fn create_exec(
        &self,
        _container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<CreateExecResults> {
        let mut state = self.state();
        state.exec_commands.push(options.cmd.unwrap_or_default());
        state.exec_env.push(options.env.unwrap_or_default());
        Ok(CreateExecResults {
            id: "fake-exec".to_owned(),
        })
    }

    async fn start_exec(
        &self,
        _exec_id: &str,
        _options: Option<StartExecOptions>,
    ) -> Result<StartExecResults> {
        let state = self.state();
        let mut output = frames(&state.exec.stdout, false);
        output.extend(frames(&state.exec.stderr, true));
        Ok(StartExecResults::Attached {
            output: Box::pin(stream::iter(
                output
                    .into_iter()
                    .map(Ok::<_, bollard::errors::Error>),
            )),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecInspectResponse> {
        let mut state = self.state();
        state.inspect_calls += 1;
        let running = state
            .exec
            .running_polls
            .map_or(true, |polls| state.inspect_calls <= polls);
        Ok(ExecInspectResponse {
            running: Some(running),
            exit_code: (!running).then_some(state.exec.exit_code),
            ..Default::default()
        })
    }
}
