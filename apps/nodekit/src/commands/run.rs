//! Run command for the nodekit CLI.
//!
//! Acquires a toolchain and runs a command with it:
//!
//! ```bash
//! nodekit run ^18 -- {npm} ci
//! nodekit run -- npx tsc --noEmit
//! ```
//!
//! `{node}`, `{npm}` and `{npx}` anywhere in the command are replaced with
//! the toolchain's paths. The toolchain's bin directory is prepended to
//! `PATH`, so bare `node`/`npm`/`npx` (and scripts spawning them) resolve to
//! the same toolchain.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use clap::Args;
use tracing::debug;

use super::SpecArgs;
use crate::errors::NodekitError;

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: SpecArgs,

    /// Command to run, after `--`.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Executes the run command.
///
/// ## Exit Codes
///
/// - Returns `Ok(())` if the command succeeds
/// - Returns `Err(NodekitError::ProcessExitCode)` if it exits non-zero
///
/// # Errors
///
/// Returns an error if acquisition fails or the command cannot be started.
pub async fn execute(args: &RunArgs, config: Option<&Path>) -> Result<()> {
    let options = args.target.options(config)?;
    let spec = args.target.spec(&options)?;
    let allow_system = options.allow_system;

    let toolchain = super::toolchain(options)?;
    let handle = toolchain.acquire(&spec, allow_system).await?;

    let expanded = handle.expand_command(&args.command);
    let Some((program, rest)) = expanded.split_first() else {
        return Err(NodekitError::EmptyCommand.into());
    };
    let path = handle.path_env()?;

    debug!(program = %program, version = %handle.version, "running command");
    let status = Command::new(program)
        .args(rest)
        .env("PATH", path)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to execute {program}"))?;

    if !status.success() {
        let code = status.code().unwrap_or(1);
        return Err(NodekitError::process_exit_code(code).into());
    }
    Ok(())
}
