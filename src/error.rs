//! Error types for icm-docker
//!
//! Every variant carries a stable code (`E001`..`E007`) that is shown in the
//! `Display` output so scripts can match on it.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while orchestrating containers
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid or incomplete configuration, also used for exec exit code 2
    #[error("[E001] configuration error: {message}")]
    Config { message: String },

    /// A container with the requested name exists but runs another image
    #[error(
        "[E002] container '{name}' was created from image '{actual}' but '{expected}' is required; remove it manually"
    )]
    Conflict {
        name: String,
        expected: String,
        actual: String,
    },

    /// A probe, log watch or exec poll exceeded its time budget
    #[error("[E003] {operation} did not complete within {limit:?}")]
    Timeout { operation: String, limit: Duration },

    /// A command inside a container failed or reported failures
    #[error("[E004] execution failed{}: {message}", exit_code.map(|c| format!(" (exit {c})")).unwrap_or_default())]
    ExecutionFailure {
        exit_code: Option<i64>,
        message: String,
    },

    /// The Docker daemon rejected a request
    #[error("[E005] docker {operation} failed{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Docker {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    /// The named container does not exist
    #[error("[E006] container '{name}' not found")]
    NotFound { name: String },

    /// Local filesystem preparation failed
    #[error("[E007] cannot prepare '{path}': {message}")]
    Io { path: String, message: String },
}

impl OrchestratorError {
    /// Stable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "E001",
            Self::Conflict { .. } => "E002",
            Self::Timeout { .. } => "E003",
            Self::ExecutionFailure { .. } => "E004",
            Self::Docker { .. } => "E005",
            Self::NotFound { .. } => "E006",
            Self::Io { .. } => "E007",
        }
    }

    /// HTTP status reported by the daemon, if this is a Docker error.
    pub fn docker_status(&self) -> Option<u16> {
        match self {
            Self::Docker { status, .. } => *status,
            _ => None,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Extract the daemon status code from an error chain.
pub fn docker_status(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<OrchestratorError>()
        .and_then(OrchestratorError::docker_status)
}

/// Result type alias using [`OrchestratorError`]
pub type Result<T> = std::result::Result<T, OrchestratorError>;
