//! Task layer
//!
//! Resolves configuration into descriptors and invocations, then sequences
//! lifecycle and exec calls. Each call re-reads the daemon state.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::commands::{self, CleanDb, PrepareMode};
use crate::config::{Config, PollPolicy};
use crate::descriptor::ContainerRole;
use crate::docker::DockerOperations;
use crate::error::OrchestratorError;
use crate::exec::{ExecInvocation, ExecRunner};
use crate::handle::ContainerHandle;
use crate::lifecycle::{ContainerLifecycleController, ContainerState};
use crate::log_stream::{ExecResult, LogStreamProcessor, ResultPattern};

/// Entry points used by the CLI.
pub struct Tasks {
    config: Config,
    controller: ContainerLifecycleController,
    exec: ExecRunner,
    json_logs: bool,
}

impl Tasks {
    pub fn new(config: Config, docker: Arc<dyn DockerOperations>) -> Self {
        let controller =
            ContainerLifecycleController::new(Arc::clone(&docker), config.timings.clone());
        Self {
            config,
            controller,
            exec: ExecRunner::new(docker),
            json_logs: false,
        }
    }

    /// Forward raw JSON log lines for every container and exec.
    #[must_use]
    pub fn with_json_logs(mut self, json_logs: bool) -> Self {
        self.json_logs = json_logs;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Make sure the role's container exists, runs and is ready.
    pub async fn start(&self, role: ContainerRole) -> Result<ContainerHandle> {
        let mut descriptor = role.descriptor(&self.config)?;
        descriptor.json_logs |= self.json_logs;
        self.controller.ensure_running(&descriptor).await
    }

    pub async fn stop(&self, role: ContainerRole) -> Result<()> {
        let handle = self.current(role).await?;
        if !handle.exists() {
            info!(container = handle.name(), "not present, nothing to stop");
            return Ok(());
        }
        self.controller.stop(&handle).await
    }

    pub async fn remove(&self, role: ContainerRole) -> Result<()> {
        let handle = self.current(role).await?;
        if !handle.exists() {
            info!(container = handle.name(), "not present, nothing to remove");
            return Ok(());
        }
        self.controller.remove(&handle).await
    }

    /// Remove every container of this project.
    pub async fn remove_all(&self) -> Result<usize> {
        self.controller
            .remove_all_with_prefix(&self.config.project_prefix)
            .await
    }

    pub async fn status(&self, role: ContainerRole) -> Result<ContainerState> {
        self.controller
            .status(&self.config.container_name(role.as_str()))
            .await
    }

    /// Initialize the database from scratch.
    pub async fn db_init(&self) -> Result<ExecResult> {
        self.config.require_database()?;
        let container = self.running_appserver().await?;
        let invocation = ExecInvocation::new(
            container,
            commands::db_init(),
            self.config.timings.db_init,
        )
        .expecting_summary();
        self.run_exec(&invocation, true).await
    }

    /// Prepare or migrate the database.
    pub async fn db_prepare(
        &self,
        mode: PrepareMode,
        clean: CleanDb,
        cartridges: &[String],
        property_keys: &[String],
    ) -> Result<ExecResult> {
        self.config.require_database()?;
        let container = self.running_appserver().await?;
        let invocation = ExecInvocation::new(
            container,
            commands::db_prepare(mode, clean, cartridges, property_keys),
            self.config.timings.db_prepare,
        )
        .expecting_summary();
        self.run_exec(&invocation, true).await
    }

    /// Run one unit test suite of a cartridge.
    pub async fn unit_test(&self, cartridge: &str, suite: &str) -> Result<ExecResult> {
        let command = commands::unit_test(&self.config.server.build_dir, cartridge, suite)?;
        let container = self.running_appserver().await?;
        let invocation = ExecInvocation::new(container, command, self.poll_for_unit_tests());
        self.run_exec(&invocation, false).await
    }

    fn poll_for_unit_tests(&self) -> PollPolicy {
        self.config.timings.unit_test
    }

    async fn run_exec(&self, invocation: &ExecInvocation, summary: bool) -> Result<ExecResult> {
        let mut processor = LogStreamProcessor::console().with_json_passthrough(self.json_logs);
        if summary {
            let pattern = ResultPattern::initialization_summary()
                .map_err(|e| OrchestratorError::config(format!("invalid summary pattern: {e}")))?;
            processor = processor.with_result_pattern(pattern);
        }
        let result = self.exec.run(invocation, processor).await?;
        if !result.message.is_empty() {
            info!("{}", result.message);
        }
        Ok(result)
    }

    async fn current(&self, role: ContainerRole) -> Result<ContainerHandle> {
        self.controller
            .find(&self.config.container_name(role.as_str()), None)
            .await
    }

    /// Id of the running application server container.
    async fn running_appserver(&self) -> Result<String> {
        let handle = self.current(ContainerRole::AppServer).await?;
        match handle.id() {
            Some(id) if handle.is_running() => Ok(id.to_owned()),
            _ => Err(OrchestratorError::NotFound {
                name: handle.name().to_owned(),
            }
            .into()),
        }
    }
}
