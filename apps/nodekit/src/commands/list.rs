//! List command for the nodekit CLI.
//!
//! ## Output Format
//!
//! ```text
//! Cached toolchains in /home/me/.cache/nodekit:
//!   ready       node-v18.17.0-linux-x64
//!   installing  node-v20.9.0-linux-x64
//! ```

use std::path::Path;

use anyhow::Result;
use clap::Args;
use nodekit_toolchain::CacheState;

use super::CacheArgs;

/// Arguments for the list command.
#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub cache: CacheArgs,

    /// Remove orphaned staging directories before listing.
    #[arg(long)]
    pub sweep: bool,
}

/// Executes the list command.
///
/// # Errors
///
/// Returns an error if the cache cannot be read.
pub async fn execute(args: &ListArgs, config: Option<&Path>) -> Result<()> {
    let options = args.cache.options(config)?;
    let toolchain = super::toolchain(options)?;

    if args.sweep {
        let removed = toolchain.sweep_staging().await?;
        if removed > 0 {
            let noun = if removed == 1 { "directory" } else { "directories" };
            println!("Removed {removed} orphaned staging {noun}.");
        }
    }

    let entries = toolchain.list()?;
    if entries.is_empty() {
        println!("No cached toolchains.");
        println!();
        println!("Run 'nodekit acquire <spec>' to install one.");
        return Ok(());
    }

    println!(
        "Cached toolchains in {}:",
        toolchain.store().layout().root.display()
    );
    for entry in &entries {
        let note = match entry.state {
            CacheState::Installing => "  (in progress or interrupted)",
            CacheState::Corrupt => "  (missing executables)",
            CacheState::Ready => "",
        };
        println!(
            "  {:<11} {}{note}",
            entry.state.as_str(),
            entry.key.dir_name()
        );
    }
    Ok(())
}
