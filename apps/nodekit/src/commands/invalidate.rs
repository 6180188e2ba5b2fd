//! Invalidate command for the nodekit CLI.
//!
//! Removes the running host's cached toolchain for one exact version. The
//! next acquisition downloads it again.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use nodekit_toolchain::VersionSpec;

use super::CacheArgs;
use crate::errors::NodekitError;

/// Arguments for the invalidate command.
#[derive(Args)]
pub struct InvalidateArgs {
    /// Exact version to remove, e.g. 18.17.0.
    pub version: String,

    #[command(flatten)]
    pub cache: CacheArgs,
}

/// Executes the invalidate command.
///
/// # Errors
///
/// Returns an error if the version is not exact or the entry cannot be
/// removed.
pub async fn execute(args: &InvalidateArgs, config: Option<&Path>) -> Result<()> {
    let spec = VersionSpec::parse(&args.version)?;
    let Some(version) = spec.exact() else {
        return Err(NodekitError::NotExactVersion {
            given: args.version.clone(),
        }
        .into());
    };

    let options = args.cache.options(config)?;
    let toolchain = super::toolchain(options)?;

    if toolchain.invalidate(version).await? {
        println!("Removed node {version} ({}).", toolchain.target());
    } else {
        println!("node {version} ({}) is not cached.", toolchain.target());
    }
    Ok(())
}
