//! Declarative container descriptors
//!
//! One [`ContainerRole`] per kind of container the ICM environment uses.
//! A role combines its defaults (image, ports, environment, readiness)
//! with the user's configuration into a fully resolved
//! [`ContainerDescriptor`], which the lifecycle controller consumes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use bollard::container::Config as CreateConfig;
use bollard::service::{HostConfig, PortBinding};

use crate::config::{Config, ContainerConfig, DatabaseKind, PollPolicy};
use crate::environment::{AdditionalParameters, ContainerEnvironment};
use crate::error::OrchestratorError;
use crate::probe::Probe;

/// A host port published for a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub primary: bool,
}

impl PortMapping {
    pub fn new(name: impl Into<String>, host_port: u16, container_port: u16) -> Self {
        Self {
            name: name.into(),
            host_port,
            container_port,
            primary: false,
        }
    }

    #[must_use]
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }
}

/// Port mappings of one container; at most one may be primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMappings {
    mappings: Vec<PortMapping>,
}

impl PortMappings {
    /// Add a mapping, rejecting a second primary immediately.
    pub fn push(&mut self, mapping: PortMapping) -> Result<()> {
        if mapping.primary {
            if let Some(existing) = self.primary() {
                return Err(OrchestratorError::config(format!(
                    "port mapping '{}' cannot be primary, '{}' already is",
                    mapping.name, existing.name
                ))
                .into());
            }
        }
        self.mappings.push(mapping);
        Ok(())
    }

    pub fn primary(&self) -> Option<&PortMapping> {
        self.mappings.iter().find(|m| m.primary)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortMapping> {
        self.mappings.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl<'a> IntoIterator for &'a PortMappings {
    type Item = &'a PortMapping;
    type IntoIter = std::slice::Iter<'a, PortMapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.mappings.iter()
    }
}

/// Bind mount; the host directory is created before the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl VolumeMount {
    fn bind(&self) -> String {
        format!("{}:{}", self.host_path.display(), self.container_path)
    }
}

/// Wait for a log line containing `marker` after start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWatch {
    pub marker: String,
    pub policy: PollPolicy,
}

/// How startup completion is confirmed. Probes run first, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub probes: Vec<Probe>,
    pub log_watch: Option<LogWatch>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty() && self.log_watch.is_none()
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDescriptor {
    pub name: String,
    pub image: String,
    pub volumes: Vec<VolumeMount>,
    pub env: ContainerEnvironment,
    pub ports: PortMappings,
    pub host_user: Option<String>,
    pub network: Option<String>,
    pub auto_remove: bool,
    pub cmd: Option<Vec<String>>,
    pub readiness: Readiness,
    pub json_logs: bool,
}

impl ContainerDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            volumes: Vec::new(),
            env: ContainerEnvironment::new(),
            ports: PortMappings::default(),
            host_user: None,
            network: None,
            auto_remove: false,
            cmd: None,
            readiness: Readiness::default(),
            json_logs: false,
        }
    }

    /// Build the daemon's create request.
    pub fn create_config(&self) -> CreateConfig<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &self.ports {
            let key = format!("{}/tcp", mapping.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }
        let binds: Vec<String> = self.volumes.iter().map(VolumeMount::bind).collect();

        CreateConfig {
            image: Some(self.image.clone()),
            env: (!self.env.is_empty()).then(|| self.env.render()),
            user: self.host_user.clone(),
            cmd: self.cmd.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                network_mode: self.network.clone(),
                auto_remove: Some(self.auto_remove),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// The kinds of containers in an ICM environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerRole {
    AppServer,
    Mail,
    Mssql,
    Oracle,
    Solr,
    Zookeeper,
    WebAdapter,
}

impl ContainerRole {
    pub const ALL: [Self; 7] = [
        Self::AppServer,
        Self::Mail,
        Self::Mssql,
        Self::Oracle,
        Self::Solr,
        Self::Zookeeper,
        Self::WebAdapter,
    ];

    /// Name used in config sections and container names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AppServer => "appserver",
            Self::Mail => "mail",
            Self::Mssql => "mssql",
            Self::Oracle => "oracle",
            Self::Solr => "solr",
            Self::Zookeeper => "zookeeper",
            Self::WebAdapter => "webadapter",
        }
    }

    fn default_image(self) -> Option<&'static str> {
        match self {
            Self::Mail => Some("mailhog/mailhog:latest"),
            Self::Mssql => Some("mcr.microsoft.com/mssql/server:2019-latest"),
            Self::Oracle => Some("gvenzl/oracle-xe:21-slim"),
            Self::Solr => Some("solr:8.11"),
            Self::Zookeeper => Some("zookeeper:3.8"),
            // Product images are version specific and must be configured
            Self::AppServer | Self::WebAdapter => None,
        }
    }

    fn default_ports(self, config: &Config) -> Vec<PortMapping> {
        match self {
            Self::AppServer => vec![
                PortMapping::new("management", config.server.management_port, 7743).primary(),
                PortMapping::new("servlet", 7771, 7771),
                PortMapping::new("debug", 7746, 7746),
            ],
            Self::Mail => vec![
                PortMapping::new("smtp", 25, 1025).primary(),
                PortMapping::new("web", 8025, 8025),
            ],
            Self::Mssql => vec![PortMapping::new("database", 1433, 1433).primary()],
            Self::Oracle => vec![PortMapping::new("database", 1521, 1521).primary()],
            Self::Solr => vec![PortMapping::new("solr", 8983, 8983).primary()],
            Self::Zookeeper => vec![PortMapping::new("client", 2181, 2181).primary()],
            Self::WebAdapter => vec![
                PortMapping::new("https", 8443, 8443).primary(),
                PortMapping::new("http", 8080, 8080),
            ],
        }
    }

    fn default_env(self, config: &Config) -> Result<ContainerEnvironment> {
        let mut env = ContainerEnvironment::new();
        match self {
            Self::AppServer => {
                if config.server.cartridges.is_empty() {
                    return Err(OrchestratorError::config(
                        "server.cartridges must list at least one cartridge",
                    )
                    .into());
                }
                let db = config.require_database()?;
                env.set("CARTRIDGE_LIST", config.server.cartridges.join(" "))
                    .set("INTERSHOP_DATABASETYPE", database_type(db.kind))
                    .set("INTERSHOP_JDBC_URL", jdbc_url(db.kind, &db.host, db.port, &db.name))
                    .set("INTERSHOP_JDBC_USER", db.user.as_str())
                    .set("INTERSHOP_JDBC_PASSWORD", db.password.as_str())
                    .set("SERVER_NAME", "appserver");
                let params: AdditionalParameters =
                    config.server.additional_parameters.iter().collect();
                params.apply_to(&mut env);
            }
            Self::Mssql => {
                let db = config.require_database()?;
                env.set("ACCEPT_EULA", "Y")
                    .set("SA_PASSWORD", db.password.as_str())
                    .set("MSSQL_PID", "Developer")
                    .set("RECREATEDB", "false")
                    .set("RECREATEUSER", "false")
                    .set("ICM_DB_NAME", db.name.as_str())
                    .set("ICM_DB_USER", db.user.as_str())
                    .set("ICM_DB_PASSWORD", db.password.as_str());
            }
            Self::Oracle => {
                let db = config.require_database()?;
                env.set("ORACLE_PASSWORD", db.password.as_str())
                    .set("APP_USER", db.user.as_str())
                    .set("APP_USER_PASSWORD", db.password.as_str());
            }
            Self::Mail => {
                env.set("MH_STORAGE", "maildir")
                    .set("MH_MAILDIR_PATH", "/mail-data");
            }
            Self::Solr => {
                env.set("SOLR_HEAP", "1g");
            }
            Self::Zookeeper => {
                env.set("ZOO_MY_ID", "1");
            }
            Self::WebAdapter => {
                env.set("ICM_ICMSERVLETURLS", format!("cs.url.0=http://{}:7743/servlet/ConfigurationServlet", config.container_name(Self::AppServer.as_str())));
            }
        }
        Ok(env)
    }

    fn default_readiness(self, ports: &PortMappings, config: &Config) -> Readiness {
        let timings = &config.timings;
        let probes = match self {
            Self::AppServer => vec![Probe::icm_readiness(config.server.management_port, timings.http_probe)],
            Self::WebAdapter => ports
                .iter()
                .find(|m| m.name == "http")
                .map(|m| Probe::http(format!("http://localhost:{}/", m.host_port), timings.http_probe))
                .into_iter()
                .collect(),
            Self::Mail | Self::Mssql | Self::Oracle | Self::Solr | Self::Zookeeper => ports
                .primary()
                .map(|m| Probe::socket("localhost", m.host_port, timings.socket_probe))
                .into_iter()
                .collect(),
        };
        Readiness {
            probes,
            log_watch: None,
        }
    }

    /// Resolve this role against `config` into a descriptor.
    pub fn descriptor(self, config: &Config) -> Result<ContainerDescriptor> {
        let overrides = config.container(self.as_str()).cloned().unwrap_or_default();
        let image = resolve_image(self, &overrides)?;
        let mut descriptor = ContainerDescriptor::new(config.container_name(self.as_str()), image);

        if overrides.ports.is_empty() {
            for mapping in self.default_ports(config) {
                descriptor.ports.push(mapping)?;
            }
        } else {
            for port in &overrides.ports {
                let mut mapping = PortMapping::new(port.name.as_str(), port.host, port.container);
                mapping.primary = port.primary;
                descriptor.ports.push(mapping)?;
            }
        }

        descriptor.env = self.default_env(config)?;
        descriptor.env.merge(overrides.env.iter());
        descriptor.volumes = overrides
            .volumes
            .iter()
            .map(|(host, container)| VolumeMount {
                host_path: host.clone(),
                container_path: container.clone(),
            })
            .collect();
        descriptor.host_user.clone_from(&config.host_user);
        descriptor.network.clone_from(&config.network);
        descriptor.auto_remove = overrides.auto_remove;
        descriptor.json_logs = overrides.json_logs;
        descriptor.readiness = self.default_readiness(&descriptor.ports, config);
        descriptor.readiness.log_watch = overrides.ready_marker.map(|marker| LogWatch {
            marker,
            policy: config.timings.log_watch,
        });
        Ok(descriptor)
    }
}

impl fmt::Display for ContainerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerRole {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| OrchestratorError::config(format!("unknown container role '{s}'")))
    }
}

fn resolve_image(role: ContainerRole, overrides: &ContainerConfig) -> Result<String> {
    overrides
        .image
        .clone()
        .or_else(|| role.default_image().map(str::to_owned))
        .filter(|image| !image.trim().is_empty())
        .ok_or_else(|| {
            OrchestratorError::config(format!("no image configured for '{role}'")).into()
        })
}

fn database_type(kind: DatabaseKind) -> &'static str {
    match kind {
        DatabaseKind::Mssql => "mssql",
        DatabaseKind::Oracle => "oracle",
    }
}

fn jdbc_url(kind: DatabaseKind, host: &str, port: u16, name: &str) -> String {
    match kind {
        DatabaseKind::Mssql => format!("jdbc:sqlserver://{host}:{port};databaseName={name}"),
        DatabaseKind::Oracle => format!("jdbc:oracle:thin:@{host}:{port}/{name}"),
    }
}
