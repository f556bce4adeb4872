//! icm-docker library
//!
//! Orchestrates the Docker containers of an ICM development environment:
//! lifecycle with readiness probing, log watching, and one-shot management
//! commands inside the application server.

pub mod commands;
pub mod config;
pub mod descriptor;
pub mod docker;
pub mod environment;
pub mod error;
pub mod exec;
pub mod handle;
pub mod lifecycle;
pub mod log_stream;
pub mod probe;
pub mod tasks;

pub use error::OrchestratorError;
pub use handle::ContainerHandle;
pub use lifecycle::ContainerLifecycleController;
