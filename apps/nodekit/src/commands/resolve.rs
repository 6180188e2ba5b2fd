//! Resolve command for the nodekit CLI.
//!
//! Prints the release a spec would install, or the system node that would be
//! used instead. Nothing is downloaded except the index and checksum list.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use nodekit_toolchain::Resolution;

use super::SpecArgs;

/// Arguments for the resolve command.
#[derive(Args)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub target: SpecArgs,

    /// Print the resolution as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the resolve command.
///
/// # Errors
///
/// Returns an error if the spec cannot be resolved.
pub async fn execute(args: &ResolveArgs, config: Option<&Path>) -> Result<()> {
    let options = args.target.options(config)?;
    let spec = args.target.spec(&options)?;
    let allow_system = options.allow_system;

    let toolchain = super::toolchain(options)?;
    let resolution = toolchain.resolve(&spec, allow_system).await?;

    match (&resolution, args.json) {
        (Resolution::Release(release), true) => {
            let value = serde_json::json!({
                "source": "release",
                "version": release.version.to_string(),
                "target": release.target.to_string(),
                "lts": release.lts,
                "archive": release.archive_name,
                "url": release.archive_url,
                "checksum": format!("{}:{}", release.checksum_algorithm.as_str(), release.checksum),
                "cached": toolchain.store().lookup(&release.key()).is_some(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        (Resolution::Release(release), false) => {
            let cached = toolchain.store().lookup(&release.key()).is_some();
            println!(
                "{} ({}{})",
                release.version,
                release.target,
                match (&release.lts, cached) {
                    (Some(lts), true) => format!(", lts {lts}, cached"),
                    (Some(lts), false) => format!(", lts {lts}"),
                    (None, true) => ", cached".to_string(),
                    (None, false) => String::new(),
                }
            );
            println!("url:      {}", release.archive_url);
            println!(
                "checksum: {}:{}",
                release.checksum_algorithm.as_str(),
                release.checksum
            );
        }
        (Resolution::System(system), true) => {
            let value = serde_json::json!({
                "source": "system",
                "version": system.version.to_string(),
                "node": system.executables.node,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        (Resolution::System(system), false) => {
            println!("{} (system)", system.version);
            println!("node:     {}", system.executables.node.display());
        }
    }
    Ok(())
}
