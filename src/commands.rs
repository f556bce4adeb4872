//! Management commands run inside the application server container.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::error::OrchestratorError;

/// Main ICM control script.
pub const INTERSHOP_SCRIPT: &str = "/intershop/bin/intershop.sh";
/// Unit test runner script.
pub const UNIT_RUNNER_SCRIPT: &str = "/intershop/bin/ishunitrunner.sh";

/// `dbprepare` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareMode {
    Init,
    Migrate,
    #[default]
    Auto,
}

/// Whether `dbprepare` empties the database first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanDb {
    Yes,
    #[default]
    No,
    Only,
}

impl fmt::Display for PrepareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::Migrate => "migrate",
            Self::Auto => "auto",
        })
    }
}

impl fmt::Display for CleanDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Only => "only",
        })
    }
}

impl FromStr for PrepareMode {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "migrate" => Ok(Self::Migrate),
            "auto" => Ok(Self::Auto),
            _ => Err(OrchestratorError::config(format!(
                "unknown dbprepare mode '{s}' (expected init, migrate or auto)"
            ))),
        }
    }
}

impl FromStr for CleanDb {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            "only" => Ok(Self::Only),
            _ => Err(OrchestratorError::config(format!(
                "unknown clean-db value '{s}' (expected yes, no or only)"
            ))),
        }
    }
}

fn owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_owned()).collect()
}

/// Full database initialization, dropping existing content.
pub fn db_init() -> Vec<String> {
    owned(&[INTERSHOP_SCRIPT, "dbinit", "-classic", "--clean-db=yes"])
}

/// Database preparation with optional cartridge and property-key filters.
pub fn db_prepare(
    mode: PrepareMode,
    clean: CleanDb,
    cartridges: &[String],
    property_keys: &[String],
) -> Vec<String> {
    let mut cmd = owned(&[INTERSHOP_SCRIPT, "dbprepare", "-classic"]);
    cmd.push(format!("--mode={mode}"));
    cmd.push(format!("--clean-db={clean}"));
    if !cartridges.is_empty() {
        cmd.push(format!("--cartridges={}", cartridges.join(",")));
    }
    if !property_keys.is_empty() {
        cmd.push(format!("--property-keys={}", property_keys.join(",")));
    }
    cmd
}

/// Unit test suite run for one cartridge.
pub fn unit_test(build_dir: &str, cartridge: &str, suite: &str) -> Result<Vec<String>> {
    if cartridge.trim().is_empty() {
        return Err(OrchestratorError::config("unit tests need a cartridge").into());
    }
    if suite.trim().is_empty() {
        return Err(OrchestratorError::config("unit tests need a test suite").into());
    }
    Ok(vec![
        UNIT_RUNNER_SCRIPT.to_owned(),
        build_dir.to_owned(),
        cartridge.to_owned(),
        format!("-s={suite}"),
    ])
}
