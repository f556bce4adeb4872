//! Docker operations abstraction for testing.
//!
//! Provides a trait over the Docker Engine API calls the orchestrator needs,
//! enabling fake daemons in tests to cover races (conflict on remove,
//! not-found on stop) and exec polling without a running Docker.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, CreateExecResults, StartExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::service::{ContainerCreateResponse, ContainerSummary, ExecInspectResponse, ImageSummary};
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::OrchestratorError;

/// Trait for Docker operations.
///
/// Uses async-trait for dyn dispatch (Rust async fn in traits doesn't support dyn yet).
#[async_trait]
pub trait DockerOperations: Send + Sync {
    /// List all containers (running or not) whose name matches `name`.
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>>;

    /// Create a container with the given name.
    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, waiting `timeout_secs` before the daemon kills it.
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// List local images matching `reference`.
    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>>;

    /// Pull an image, consuming the progress stream.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Follow stdout and stderr of a container from the beginning.
    fn logs(&self, id: &str) -> BoxStream<'static, Result<LogOutput>>;

    /// Create an exec instance in a container.
    async fn create_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<CreateExecResults>;

    /// Start an exec instance.
    async fn start_exec(
        &self,
        exec_id: &str,
        options: Option<StartExecOptions>,
    ) -> Result<StartExecResults>;

    /// Inspect an exec instance to get its running flag and exit code.
    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse>;
}

/// Real implementation wrapping [`bollard::Docker`].
#[derive(Clone)]
pub struct BollardDocker {
    inner: Docker,
}

impl BollardDocker {
    /// Create a new `BollardDocker` from a [`bollard::Docker`] instance.
    #[must_use]
    pub fn new(docker: Docker) -> Self {
        Self { inner: docker }
    }

    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| map_docker_error("connect", e))?;
        Ok(Self::new(docker))
    }
}

/// Convert a bollard error into [`OrchestratorError::Docker`], keeping the status code.
fn map_docker_error(operation: &str, err: bollard::errors::Error) -> anyhow::Error {
    let (status, message) = match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => (Some(status_code), message),
        other => (None, other.to_string()),
    };
    OrchestratorError::Docker {
        operation: operation.to_owned(),
        status,
        message,
    }
    .into()
}

#[async_trait]
impl DockerOperations for BollardDocker {
    async fn list_containers(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_owned(), vec![name.to_owned()]);
        self.inner
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error("list_containers", e))
    }

    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse> {
        self.inner
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_owned(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| map_docker_error("create_container", e))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.inner
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_error("start_container", e))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        self.inner
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
            .map_err(|e| map_docker_error("stop_container", e))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.inner
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_docker_error("remove_container", e))
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>> {
        let mut filters = HashMap::new();
        filters.insert("reference".to_owned(), vec![reference.to_owned()]);
        self.inner
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_docker_error("list_images", e))
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut stream = self.inner.create_image(
            Some(CreateImageOptions {
                from_image: reference.to_owned(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| map_docker_error("pull_image", e))?;
            if let Some(error) = info.error {
                return Err(OrchestratorError::Docker {
                    operation: "pull_image".to_owned(),
                    status: None,
                    message: error,
                }
                .into());
            }
            if let Some(status) = info.status {
                tracing::debug!(image = reference, "pull: {status}");
            }
        }
        Ok(())
    }

    fn logs(&self, id: &str) -> BoxStream<'static, Result<LogOutput>> {
        self.inner
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    tail: "all".to_owned(),
                    ..Default::default()
                }),
            )
            .map(|item| item.map_err(|e| map_docker_error("logs", e)))
            .boxed()
    }

    async fn create_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> Result<CreateExecResults> {
        self.inner
            .create_exec(container_id, options)
            .await
            .map_err(|e| map_docker_error("create_exec", e))
    }

    async fn start_exec(
        &self,
        exec_id: &str,
        options: Option<StartExecOptions>,
    ) -> Result<StartExecResults> {
        self.inner
            .start_exec(exec_id, options)
            .await
            .map_err(|e| map_docker_error("start_exec", e))
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspectResponse> {
        self.inner
            .inspect_exec(exec_id)
            .await
            .map_err(|e| map_docker_error("inspect_exec", e))
    }
}
