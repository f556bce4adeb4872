//! Container identity and state snapshots.

use anyhow::Result;
use bollard::service::ContainerSummary;

use crate::docker::DockerOperations;
use crate::error::OrchestratorError;

/// Snapshot of a named container as reported by the daemon.
///
/// Built fresh for every operation; never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    id: Option<String>,
    name: String,
    image: String,
    running: bool,
}

impl ContainerHandle {
    /// Placeholder for a container that has not been created yet.
    pub fn desired(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            image: image.into(),
            running: false,
        }
    }

    /// Handle for an existing container.
    pub fn existing(
        id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        running: bool,
    ) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            image: image.into(),
            running,
        }
    }

    /// Query the daemon for the container named exactly `name`.
    ///
    /// Returns a desired placeholder when no such container exists. When
    /// `expected_image` is given and the found container runs another image,
    /// fails with [`OrchestratorError::Conflict`].
    pub async fn resolve(
        docker: &dyn DockerOperations,
        name: &str,
        expected_image: Option<&str>,
    ) -> Result<Self> {
        // The daemon's name filter is a substring match, so filter again on `/name`.
        let wanted = format!("/{name}");
        let summaries = docker.list_containers(name).await?;
        let found = summaries.into_iter().find(|summary| {
            summary
                .names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| *n == wanted))
        });

        let Some(summary) = found else {
            return Ok(Self::desired(name, expected_image.unwrap_or_default()));
        };

        let handle = Self::from_summary(name, summary)?;
        if let Some(expected) = expected_image {
            if handle.image != expected {
                return Err(OrchestratorError::Conflict {
                    name: name.to_owned(),
                    expected: expected.to_owned(),
                    actual: handle.image,
                }
                .into());
            }
        }
        Ok(handle)
    }

    fn from_summary(name: &str, summary: ContainerSummary) -> Result<Self> {
        let id = summary.id.ok_or_else(|| OrchestratorError::Docker {
            operation: "list_containers".to_owned(),
            status: None,
            message: format!("container '{name}' reported without an id"),
        })?;
        let running = summary.state.as_deref() == Some("running");
        Ok(Self::existing(
            id,
            name,
            summary.image.unwrap_or_default(),
            running,
        ))
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Always false for handles without an id.
    pub fn is_running(&self) -> bool {
        self.id.is_some() && self.running
    }

    pub fn exists(&self) -> bool {
        self.id.is_some()
    }

    /// Id if present, otherwise the name; both are accepted by the daemon.
    pub fn target(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub(crate) fn with_running(mut self, running: bool) -> Self {
        self.running = running;
        self
    }
}
