//! Command modules for the nodekit CLI.
//!
//! - [`acquire`] - Ensure a toolchain is available
//! - [`resolve`] - Resolve a spec without downloading
//! - [`list`] - List cached toolchains
//! - [`invalidate`] - Remove a cached toolchain
//! - [`run`] - Run a command with an acquired toolchain
//!
//! Shared here: the project/cache flags every command accepts and the rules
//! for turning them, the config file and `package.json` into options and a
//! version spec.

pub mod acquire;
pub mod invalidate;
pub mod list;
pub mod resolve;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use nodekit_toolchain::package::engines_node;
use nodekit_toolchain::{Toolchain, ToolchainOptions, VersionSpec};
use tracing::debug;

/// Flags locating the project and the cache.
#[derive(Args, Debug, Clone, Default)]
pub struct CacheArgs {
    /// Cache root (overrides NODEKIT_HOME and the config file).
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Project directory holding nodekit.toml and package.json.
    #[arg(long, value_name = "DIR")]
    pub project: Option<PathBuf>,
}

/// Flags selecting a toolchain.
#[derive(Args, Debug, Clone, Default)]
pub struct SpecArgs {
    /// Version spec, e.g. 18.17.0, ^18, lts/hydrogen.
    pub spec: Option<String>,

    /// Never use a node installed on the system.
    #[arg(long)]
    pub no_system: bool,

    #[command(flatten)]
    pub cache: CacheArgs,
}

impl CacheArgs {
    fn project_dir(&self) -> Result<PathBuf> {
        match &self.project {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("Failed to determine current directory"),
        }
    }

    /// Loads options for this invocation: config file, then environment, then
    /// flags.
    pub fn options(&self, config: Option<&Path>) -> Result<ToolchainOptions> {
        let project = self.project_dir()?;
        let mut options = ToolchainOptions::load(config, &project)
            .context("Failed to load configuration")?;
        if let Some(dir) = &self.cache_dir {
            options.cache_dir = Some(dir.clone());
        }
        Ok(options)
    }
}

impl SpecArgs {
    /// Options for this invocation, with `--no-system` applied.
    pub fn options(&self, config: Option<&Path>) -> Result<ToolchainOptions> {
        let mut options = self.cache.options(config)?;
        if self.no_system {
            options.allow_system = false;
        }
        Ok(options)
    }

    /// The spec to resolve: the argument, else `node-version` from the config,
    /// else `engines.node` from `package.json`, else `lts`.
    pub fn spec(&self, options: &ToolchainOptions) -> Result<VersionSpec> {
        let raw = match (&self.spec, &options.node_version) {
            (Some(spec), _) => Some(spec.clone()),
            (None, Some(configured)) => Some(configured.clone()),
            (None, None) => {
                let project = self.cache.project_dir()?;
                engines_node(&project).context("Failed to read package.json")?
            }
        };

        match raw {
            Some(raw) => {
                debug!(spec = %raw, "using version spec");
                Ok(VersionSpec::parse(&raw)?)
            }
            None => {
                debug!("no version requirement found, using lts");
                Ok(VersionSpec::Lts)
            }
        }
    }
}

/// Builds the toolchain manager for `options`.
pub fn toolchain(options: ToolchainOptions) -> Result<Toolchain> {
    Toolchain::new(options).context("Failed to set up toolchain cache")
}
