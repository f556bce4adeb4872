//! Configuration parsing from icm-docker.toml
//!
//! Holds project-wide settings, per-role container overrides, and the timing
//! policies for every kind of wait the orchestrator performs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::OrchestratorError;

/// Default config file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "icm-docker.toml";

/// Default management port of the application server.
pub const DEFAULT_MANAGEMENT_PORT: u16 = 7743;

// Named defaults for each wait. All values in milliseconds.
const HTTP_PROBE_INTERVAL_MS: u64 = 5_000;
const HTTP_PROBE_TIMEOUT_MS: u64 = 600_000;
const SOCKET_PROBE_INTERVAL_MS: u64 = 1_000;
const SOCKET_PROBE_TIMEOUT_MS: u64 = 120_000;
const LOG_WATCH_INTERVAL_MS: u64 = 5_000;
const LOG_WATCH_TIMEOUT_MS: u64 = 600_000;
const DB_INIT_POLL_MS: u64 = 5_000;
const DB_INIT_MAX_MS: u64 = 6_000_000;
const DB_PREPARE_POLL_MS: u64 = 5_000;
const DB_PREPARE_MAX_MS: u64 = 6_000_000;
const UNIT_TEST_POLL_MS: u64 = 50_000;
const UNIT_TEST_MAX_MS: u64 = 6_000_000;
const REMOVAL_ATTEMPTS: u32 = 5;
const REMOVAL_DELAY_MS: u64 = 1_000;
const STOP_TIMEOUT_SECS: i64 = 10;

/// A poll loop budget: check every `interval_ms`, give up after `timeout_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl PollPolicy {
    #[must_use]
    pub const fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Bounded retry with a fixed delay, used for daemon conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Timing policies per operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub http_probe: PollPolicy,
    pub socket_probe: PollPolicy,
    pub log_watch: PollPolicy,
    pub db_init: PollPolicy,
    pub db_prepare: PollPolicy,
    pub unit_test: PollPolicy,
    pub removal: RetryPolicy,
    /// Seconds the daemon waits for a graceful stop before killing.
    pub stop_timeout_secs: i64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            http_probe: PollPolicy::new(HTTP_PROBE_INTERVAL_MS, HTTP_PROBE_TIMEOUT_MS),
            socket_probe: PollPolicy::new(SOCKET_PROBE_INTERVAL_MS, SOCKET_PROBE_TIMEOUT_MS),
            log_watch: PollPolicy::new(LOG_WATCH_INTERVAL_MS, LOG_WATCH_TIMEOUT_MS),
            db_init: PollPolicy::new(DB_INIT_POLL_MS, DB_INIT_MAX_MS),
            db_prepare: PollPolicy::new(DB_PREPARE_POLL_MS, DB_PREPARE_MAX_MS),
            unit_test: PollPolicy::new(UNIT_TEST_POLL_MS, UNIT_TEST_MAX_MS),
            removal: RetryPolicy {
                attempts: REMOVAL_ATTEMPTS,
                delay_ms: REMOVAL_DELAY_MS,
            },
            stop_timeout_secs: STOP_TIMEOUT_SECS,
        }
    }
}

/// A single port mapping as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub host: u16,
    pub container: u16,
    #[serde(default)]
    pub primary: bool,
}

/// Per-role container overrides from `[containers.<role>]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    /// Docker image reference (e.g. "intershophub/icm-as:11.0.0")
    pub image: Option<String>,
    /// Replaces the role's default ports when non-empty
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    /// Host path to container path bind mounts
    #[serde(default)]
    pub volumes: BTreeMap<PathBuf, String>,
    /// Extra environment, applied after the role defaults
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Log line substring that signals startup completion
    #[serde(default)]
    pub ready_marker: Option<String>,
    /// Forward raw JSON log lines instead of extracted messages
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub auto_remove: bool,
}

/// Application server settings from `[server]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub management_port: u16,
    pub cartridges: Vec<String>,
    pub build_dir: String,
    pub additional_parameters: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            management_port: DEFAULT_MANAGEMENT_PORT,
            cartridges: Vec::new(),
            build_dir: "/intershop/build".to_owned(),
            additional_parameters: BTreeMap::new(),
        }
    }
}

/// Supported database products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Mssql,
    Oracle,
}

/// Database connection settings from `[database]`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Prefix of every container name (`<prefix>-<role>`)
    #[serde(default = "default_project_prefix")]
    pub project_prefix: String,
    #[serde(default)]
    pub network: Option<String>,
    /// `uid:gid` the containers run as
    #[serde(default)]
    pub host_user: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerConfig>,
    #[serde(default)]
    pub timings: Timings,
}

fn default_project_prefix() -> String {
    "icm".to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_prefix: default_project_prefix(),
            network: None,
            host_user: None,
            server: ServerConfig::default(),
            database: None,
            containers: BTreeMap::new(),
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| OrchestratorError::config(format!("malformed TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.project_prefix.trim().is_empty() {
            return Err(OrchestratorError::config("project_prefix cannot be empty").into());
        }
        for (role, container) in &self.containers {
            let primaries = container.ports.iter().filter(|p| p.primary).count();
            if primaries > 1 {
                return Err(OrchestratorError::config(format!(
                    "container '{role}' declares {primaries} primary port mappings"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Overrides for a role, if configured.
    pub fn container(&self, role: &str) -> Option<&ContainerConfig> {
        self.containers.get(role)
    }

    /// Container name for a role.
    pub fn container_name(&self, role: &str) -> String {
        format!("{}-{role}", self.project_prefix)
    }

    /// Database settings, required by database roles and exec tasks.
    pub fn require_database(&self) -> Result<&DatabaseConfig> {
        self.database.as_ref().ok_or_else(|| {
            OrchestratorError::config("no [database] section in configuration").into()
        })
    }
}
