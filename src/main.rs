//! icm-docker CLI entry point

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use icm_docker::commands::{CleanDb, PrepareMode};
use icm_docker::config::{Config, DEFAULT_CONFIG_FILE};
use icm_docker::descriptor::ContainerRole;
use icm_docker::docker::BollardDocker;
use icm_docker::tasks::Tasks;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "icm-docker", version, about = "Manage the containers of an ICM environment")]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, env = "ICM_DOCKER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Forward raw JSON log lines instead of extracted messages
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create, start and wait for a container
    Start { role: ContainerRole },
    /// Stop a container
    Stop { role: ContainerRole },
    /// Remove a container
    Remove { role: ContainerRole },
    /// Remove every container of this project
    RemoveAll,
    /// Show the state of a container
    Status { role: ContainerRole },
    /// Initialize the database
    Dbinit,
    /// Prepare or migrate the database
    Dbprepare {
        #[arg(long, default_value = "auto")]
        mode: PrepareMode,
        #[arg(long, default_value = "no")]
        clean_db: CleanDb,
        #[arg(long, value_delimiter = ',')]
        cartridges: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        property_keys: Vec<String>,
    },
    /// Run a unit test suite
    UnitTest {
        #[arg(long)]
        cartridge: String,
        #[arg(long)]
        suite: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::from_file(&cli.config)?;
    let docker = BollardDocker::connect().context("Is Docker running?")?;
    let tasks = Tasks::new(config, Arc::new(docker)).with_json_logs(cli.json_logs);

    // Bridge to the async Docker client
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Start { role } => {
                tasks.start(role).await?;
            }
            Command::Stop { role } => tasks.stop(role).await?,
            Command::Remove { role } => tasks.remove(role).await?,
            Command::RemoveAll => {
                tasks.remove_all().await?;
            }
            Command::Status { role } => {
                let state = tasks.status(role).await?;
                writeln!(std::io::stdout(), "{role}: {state:?}")?;
            }
            Command::Dbinit => {
                tasks.db_init().await?;
            }
            Command::Dbprepare {
                mode,
                clean_db,
                cartridges,
                property_keys,
            } => {
                tasks
                    .db_prepare(mode, clean_db, &cartridges, &property_keys)
                    .await?;
            }
            Command::UnitTest { cartridge, suite } => {
                tasks.unit_test(&cartridge, &suite).await?;
            }
        }
        Ok(())
    })
}
