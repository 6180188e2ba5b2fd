//! Acquire command for the nodekit CLI.
//!
//! ## Usage
//!
//! ```bash
//! nodekit acquire ^18
//! nodekit acquire --no-system --json
//! ```
//!
//! ## Output Format
//!
//! ```text
//! source:  cache
//! version: 18.17.0
//! root:    /home/me/.cache/nodekit/toolchains/node-v18.17.0-linux-x64
//! node:    .../bin/node
//! npm:     .../bin/npm
//! npx:     .../bin/npx
//! ```

use std::path::Path;

use anyhow::Result;
use clap::Args;
use nodekit_toolchain::ToolchainHandle;

use super::SpecArgs;

/// Arguments for the acquire command.
#[derive(Args)]
pub struct AcquireArgs {
    #[command(flatten)]
    pub target: SpecArgs,

    /// Print the handle as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the acquire command.
///
/// # Errors
///
/// Returns an error if options cannot be loaded or acquisition fails.
pub async fn execute(args: &AcquireArgs, config: Option<&Path>) -> Result<()> {
    let options = args.target.options(config)?;
    let spec = args.target.spec(&options)?;
    let allow_system = options.allow_system;

    let toolchain = super::toolchain(options)?;
    let handle = toolchain.acquire(&spec, allow_system).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&handle_json(&handle))?);
    } else {
        print_handle(&handle);
    }
    Ok(())
}

fn handle_json(handle: &ToolchainHandle) -> serde_json::Value {
    serde_json::json!({
        "source": handle.source.as_str(),
        "version": handle.version.to_string(),
        "root": handle.root,
        "node": handle.node,
        "npm": handle.npm,
        "npx": handle.npx,
    })
}

fn print_handle(handle: &ToolchainHandle) {
    println!("source:  {}", handle.source.as_str());
    println!("version: {}", handle.version);
    println!("root:    {}", handle.root.display());
    println!("node:    {}", handle.node.display());
    println!("npm:     {}", handle.npm.display());
    println!("npx:     {}", handle.npx.display());
}
