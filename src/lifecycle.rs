//! Container lifecycle management
//!
//! [`ContainerLifecycleController`] drives a named container through
//! find → create → start → readiness → stop/remove. Every step re-queries
//! the daemon, create and start are idempotent, and races with other
//! agents on stop/remove are absorbed by tolerant status handling and a
//! bounded retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Timings;
use crate::descriptor::{ContainerDescriptor, LogWatch, Readiness};
use crate::docker::DockerOperations;
use crate::error::{docker_status, OrchestratorError};
use crate::handle::ContainerHandle;
use crate::log_stream::LogStreamProcessor;
use crate::probe::poll_until;

/// Daemon status: container already in the requested state.
const STATUS_NOT_MODIFIED: u16 = 304;
/// Daemon status: no such container.
const STATUS_NOT_FOUND: u16 = 404;
/// Daemon status: conflicting operation (e.g. removal already in progress).
const STATUS_CONFLICT: u16 = 409;

/// States a named container moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Unknown,
    FoundStopped,
    FoundRunning,
    Created,
    Started,
    Ready,
    Failed,
    Removed,
}

impl ContainerState {
    /// State implied by a freshly resolved handle.
    pub fn of(handle: &ContainerHandle) -> Self {
        match (handle.exists(), handle.is_running()) {
            (false, _) => Self::Unknown,
            (true, false) => Self::FoundStopped,
            (true, true) => Self::FoundRunning,
        }
    }
}

/// Aborts the log watcher task when dropped, on every exit path.
struct WatcherGuard(JoinHandle<()>);

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Progress of a log watcher, shared with the readiness wait.
#[derive(Default)]
struct WatchState {
    ready: AtomicBool,
    ended: AtomicBool,
}

/// Orchestrates a single named container at a time.
pub struct ContainerLifecycleController {
    docker: Arc<dyn DockerOperations>,
    timings: Timings,
    processor_factory: Box<dyn Fn(bool) -> LogStreamProcessor + Send + Sync>,
}

impl ContainerLifecycleController {
    pub fn new(docker: Arc<dyn DockerOperations>, timings: Timings) -> Self {
        Self {
            docker,
            timings,
            processor_factory: Box::new(|json| {
                LogStreamProcessor::console().with_json_passthrough(json)
            }),
        }
    }

    /// Replace how log-watch processors are built (e.g. to capture output).
    #[must_use]
    pub fn with_processor_factory(
        mut self,
        factory: impl Fn(bool) -> LogStreamProcessor + Send + Sync + 'static,
    ) -> Self {
        self.processor_factory = Box::new(factory);
        self
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Look up the container by exact name.
    pub async fn find(&self, name: &str, expected_image: Option<&str>) -> Result<ContainerHandle> {
        let handle = ContainerHandle::resolve(self.docker.as_ref(), name, expected_image).await?;
        debug!(container = name, state = ?ContainerState::of(&handle), "resolved");
        Ok(handle)
    }

    /// Current state of the named container, without changing it.
    pub async fn status(&self, name: &str) -> Result<ContainerState> {
        Ok(ContainerState::of(&self.find(name, None).await?))
    }

    /// Create the container unless one with that name exists.
    pub async fn create(&self, desc: &ContainerDescriptor) -> Result<ContainerHandle> {
        let existing = self.find(&desc.name, Some(&desc.image)).await?;
        if existing.exists() {
            info!(container = %desc.name, "already exists, skipping create");
            return Ok(existing);
        }

        self.ensure_image(&desc.image).await?;
        prepare_volumes(desc).await?;

        let response = self
            .docker
            .create_container(&desc.name, desc.create_config())
            .await
            .with_context(|| format!("Failed to create container '{}'", desc.name))?;
        for warning in &response.warnings {
            warn!(container = %desc.name, "{warning}");
        }
        info!(container = %desc.name, id = %response.id, image = %desc.image, state = ?ContainerState::Created, "created");
        Ok(ContainerHandle::existing(response.id, desc.name.as_str(), desc.image.as_str(), false))
    }

    /// Pull the image if no local image matches the reference.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        let local = self.docker.list_images(image).await?;
        if local.is_empty() {
            info!(image, "pulling image");
            self.docker
                .pull_image(image)
                .await
                .with_context(|| format!("Failed to pull image '{image}'"))?;
        }
        Ok(())
    }

    /// Start the container and wait until it is ready.
    ///
    /// A running container is left alone and its probes are not re-run.
    /// If any readiness check fails the container is stopped again and
    /// the failure is returned.
    pub async fn start(
        &self,
        handle: &ContainerHandle,
        readiness: &Readiness,
        json_logs: bool,
    ) -> Result<ContainerHandle> {
        if handle.is_running() {
            info!(container = handle.name(), "already running, skipping start");
            return Ok(handle.clone());
        }
        if !handle.exists() {
            return Err(OrchestratorError::NotFound {
                name: handle.name().to_owned(),
            }
            .into());
        }

        match self.docker.start_container(handle.target()).await {
            Ok(()) => info!(container = handle.name(), state = ?ContainerState::Started, "started"),
            Err(e) if docker_status(&e) == Some(STATUS_NOT_MODIFIED) => {
                info!(container = handle.name(), "was already started");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to start '{}'", handle.name()));
            }
        }
        let started = handle.clone().with_running(true);

        if let Err(e) = self.await_readiness(&started, readiness, json_logs).await {
            error!(container = started.name(), state = ?ContainerState::Failed, "readiness failed: {e:#}");
            if let Err(stop_err) = self.stop(&started).await {
                warn!(container = started.name(), "rollback stop failed: {stop_err:#}");
            }
            return Err(e);
        }
        info!(container = started.name(), state = ?ContainerState::Ready, "ready");
        Ok(started)
    }

    /// Create if needed, then start.
    pub async fn ensure_running(&self, desc: &ContainerDescriptor) -> Result<ContainerHandle> {
        let handle = self.create(desc).await?;
        self.start(&handle, &desc.readiness, desc.json_logs).await
    }

    async fn await_readiness(
        &self,
        handle: &ContainerHandle,
        readiness: &Readiness,
        json_logs: bool,
    ) -> Result<()> {
        // Spawn the watcher first so no output is missed while probes run.
        let watcher = readiness
            .log_watch
            .as_ref()
            .map(|watch| self.spawn_log_watch(handle, watch, json_logs));

        for probe in &readiness.probes {
            if !probe.execute().await {
                return Err(OrchestratorError::Timeout {
                    operation: format!("{} for '{}'", probe.kind, handle.name()),
                    limit: probe.retry_timeout,
                }
                .into());
            }
        }

        if let (Some(watch), Some((_guard, state))) = (&readiness.log_watch, &watcher) {
            let operation = format!("log watch for '{}' in '{}'", watch.marker, handle.name());
            let settled = poll_until(
                &operation,
                watch.policy.interval(),
                watch.policy.timeout(),
                || async move {
                    state.ready.load(Ordering::SeqCst) || state.ended.load(Ordering::SeqCst)
                },
            )
            .await;
            if !settled {
                return Err(OrchestratorError::Timeout {
                    operation,
                    limit: watch.policy.timeout(),
                }
                .into());
            }
            if !state.ready.load(Ordering::SeqCst) {
                return Err(OrchestratorError::ExecutionFailure {
                    exit_code: None,
                    message: format!(
                        "log stream of '{}' ended before '{}' appeared",
                        handle.name(),
                        watch.marker
                    ),
                }
                .into());
            }
        }
        Ok(())
    }

    fn spawn_log_watch(
        &self,
        handle: &ContainerHandle,
        watch: &LogWatch,
        json_logs: bool,
    ) -> (WatcherGuard, Arc<WatchState>) {
        let state = Arc::new(WatchState::default());
        let shared = Arc::clone(&state);
        let mut processor = (self.processor_factory)(json_logs).with_ready_marker(watch.marker.as_str());
        let mut logs = self.docker.logs(handle.target());
        let name = handle.name().to_owned();

        let task = tokio::spawn(async move {
            while let Some(frame) = logs.next().await {
                match frame {
                    Ok(output) => {
                        processor.on_output(output);
                        if processor.is_ready() {
                            shared.ready.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => {
                        warn!(container = %name, "log stream ended: {e:#}");
                        break;
                    }
                }
            }
            processor.finish();
            if processor.is_ready() {
                shared.ready.store(true, Ordering::SeqCst);
            }
            // ready is published first so the wait never sees a ready stream as ended
            shared.ended.store(true, Ordering::SeqCst);
        });
        (WatcherGuard(task), state)
    }

    /// Stop the container; already-stopped and missing containers count as success.
    pub async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let timeout_secs = self.timings.stop_timeout_secs;
        self.tolerant("stop", handle.name(), || {
            self.docker.stop_container(handle.target(), timeout_secs)
        })
        .await
    }

    /// Remove the container; missing containers count as success.
    pub async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        self.tolerant("remove", handle.name(), || {
            self.docker.remove_container(handle.target())
        })
        .await?;
        info!(container = handle.name(), state = ?ContainerState::Removed, "removed");
        Ok(())
    }

    /// Remove every container whose name starts with `<prefix>-`.
    pub async fn remove_all_with_prefix(&self, prefix: &str) -> Result<usize> {
        let wanted = format!("/{prefix}-");
        let summaries = self.docker.list_containers(&format!("{prefix}-")).await?;
        let mut removed = 0;
        for summary in summaries {
            let Some(name) = summary
                .names
                .iter()
                .flatten()
                .find_map(|n| n.starts_with(&wanted).then(|| n.trim_start_matches('/').to_owned()))
            else {
                continue;
            };
            let Some(id) = summary.id else { continue };
            let handle = ContainerHandle::existing(id, name, summary.image.unwrap_or_default(), false);
            self.remove(&handle).await?;
            removed += 1;
        }
        info!(prefix, removed, "removed project containers");
        Ok(removed)
    }

    /// Run a stop/remove call, absorbing benign races.
    ///
    /// 304 and 404 are success. 409 (another agent is removing the same
    /// container) is retried with a fixed delay up to the configured number
    /// of attempts.
    async fn tolerant<F, Fut>(&self, operation: &str, name: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let policy = self.timings.removal;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(()) => {
                    info!(container = name, "{operation} done");
                    return Ok(());
                }
                Err(e) => match docker_status(&e) {
                    Some(STATUS_NOT_MODIFIED | STATUS_NOT_FOUND) => {
                        info!(container = name, "{operation}: nothing to do ({e})");
                        return Ok(());
                    }
                    Some(STATUS_CONFLICT) if attempt < policy.attempts => {
                        debug!(container = name, attempt, "{operation} conflicts, retrying");
                        attempt += 1;
                        tokio::time::sleep(policy.delay()).await;
                    }
                    _ => {
                        return Err(e).with_context(|| {
                            format!("Failed to {operation} '{name}' after {attempt} attempt(s)")
                        });
                    }
                },
            }
        }
    }
}

/// Create bind-mount source directories (`mkdir -p`).
async fn prepare_volumes(desc: &ContainerDescriptor) -> Result<()> {
    for volume in &desc.volumes {
        tokio::fs::create_dir_all(&volume.host_path)
            .await
            .map_err(|e| OrchestratorError::Io {
                path: volume.host_path.display().to_string(),
                message: e.to_string(),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn state_of_handles() {
        assert_eq!(
            ContainerState::of(&ContainerHandle::desired("a", "img")),
            ContainerState::Unknown
        );
        assert_eq!(
            ContainerState::of(&ContainerHandle::existing("1", "a", "img", false)),
            ContainerState::FoundStopped
        );
        assert_eq!(
            ContainerState::of(&ContainerHandle::existing("1", "a", "img", true)),
            ContainerState::FoundRunning
        );
    }

    #[tokio::test]
    async fn prepare_volumes_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sites/one/two");
        let mut desc = ContainerDescriptor::new("icm-appserver", "img");
        desc.volumes.push(crate::descriptor::VolumeMount {
            host_path: nested.clone(),
            container_path: "/intershop/sites".to_owned(),
        });
        prepare_volumes(&desc).await.unwrap();
        // idempotent
        prepare_volumes(&desc).await.unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn prepare_volumes_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let mut desc = ContainerDescriptor::new("icm-appserver", "img");
        desc.volumes.push(crate::descriptor::VolumeMount {
            host_path: file.join("sub"),
            container_path: "/data".to_owned(),
        });
        let err = prepare_volumes(&desc)
            .await
            .unwrap_err()
            .downcast::<OrchestratorError>()
            .unwrap();
        assert_eq!(err.code(), "E007");
    }
}
