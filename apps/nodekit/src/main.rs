#![warn(clippy::pedantic)]

//! # nodekit
//!
//! Command-line front end for the Node.js toolchain cache. Build scripts use
//! it to get a `node`, `npm` and `npx` matching a version requirement, either
//! from the system or from the shared cache, downloading on first use.
//!
//! ## Subcommands
//!
//! - `acquire` - Ensure a toolchain is available and print its paths
//! - `resolve` - Show which release a spec resolves to, without downloading
//! - `list` - List cached toolchains
//! - `invalidate` - Remove a cached toolchain
//! - `run` - Run a command with an acquired toolchain
//!
//! ## Examples
//!
//! ```bash
//! nodekit acquire ^18
//! nodekit run -- {npm} ci
//! nodekit invalidate 18.17.0
//! ```

mod commands;
mod errors;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use commands::{acquire, invalidate, list, resolve, run};
use errors::NodekitError;
use tracing_subscriber::EnvFilter;

/// Acquire and run cached Node.js toolchains.
#[derive(Parser)]
#[command(
    name = "nodekit",
    author,
    version,
    about = "Acquire and run cached Node.js toolchains",
    after_help = "\
VERSION SPECS:
    18.17.0, v18.17.0          exact version
    ^18, ~18.17, >=18 <20      npm ranges
    latest, lts, lts/hydrogen  release tags
    When omitted: node-version from nodekit.toml, then engines.node from
    package.json, then lts.

ENVIRONMENT VARIABLES:
    NODEKIT_HOME            Cache root (default: platform cache dir/nodekit)
    NODEKIT_MIRROR          Distribution server (default: https://nodejs.org/dist)
    RUST_LOG                Log filter, overrides -v"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file (default: nodekit.toml in the project directory).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands for the nodekit CLI.
#[derive(Subcommand)]
pub enum Commands {
    /// Ensure a toolchain is available and print its paths.
    ///
    /// Uses a satisfying system node when allowed, otherwise downloads,
    /// verifies and caches the matching release.
    Acquire(acquire::AcquireArgs),

    /// Show what a spec resolves to without downloading.
    Resolve(resolve::ResolveArgs),

    /// List cached toolchains and their state.
    List(list::ListArgs),

    /// Remove the cached toolchain for a version.
    Invalidate(invalidate::InvalidateArgs),

    /// Run a command with an acquired toolchain.
    ///
    /// `{node}`, `{npm}` and `{npx}` in the command are replaced with the
    /// toolchain's paths, and its bin directory is put first on PATH. The
    /// command's exit code is propagated.
    Run(run::RunArgs),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        let exit_code = handle_error(&e);
        std::process::exit(exit_code);
    }
}

/// Handles an error and returns the appropriate exit code.
///
/// For `ProcessExitCode` errors, returns the embedded exit code without
/// printing an error message. For all other errors, prints the error chain
/// and returns exit code 1.
fn handle_error(e: &anyhow::Error) -> i32 {
    if let Some(NodekitError::ProcessExitCode { code }) = e.downcast_ref::<NodekitError>() {
        return *code;
    }
    eprintln!("Error: {e:?}");
    1
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "nodekit=warn,nodekit_toolchain=warn",
        1 => "nodekit=info,nodekit_toolchain=info",
        _ => "nodekit=debug,nodekit_toolchain=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Acquire(args) => acquire::execute(&args, config).await,
        Commands::Resolve(args) => resolve::execute(&args, config).await,
        Commands::List(args) => list::execute(&args, config).await,
        Commands::Invalidate(args) => invalidate::execute(&args, config).await,
        Commands::Run(args) => run::execute(&args, config).await,
    }
}
