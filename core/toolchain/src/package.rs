//! Reading the `engines.node` requirement from `package.json`.

use std::path::Path;

use serde::Deserialize;

use crate::errors::{ToolchainError, ToolchainResult};

/// Package manifest file name.
pub const PACKAGE_JSON: &str = "package.json";

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    engines: Option<Engines>,
}

#[derive(Debug, Default, Deserialize)]
struct Engines {
    #[serde(default)]
    node: Option<String>,
}

/// Returns `engines.node` from `<dir>/package.json`.
///
/// A missing manifest, a manifest without `engines`, and a blank requirement
/// all yield `None`.
///
/// # Errors
///
/// - `Io` if the manifest exists but cannot be read
/// - `Config` if it is not valid JSON
pub fn engines_node(dir: &Path) -> ToolchainResult<Option<String>> {
    let path = dir.join(PACKAGE_JSON);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ToolchainError::io(
                format!("reading {}", path.display()),
                e,
            ));
        }
    };

    let manifest: PackageJson =
        serde_json::from_str(&content).map_err(|e| ToolchainError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;

    Ok(manifest
        .engines
        .and_then(|engines| engines.node)
        .map(|node| node.trim().to_string())
        .filter(|node| !node.is_empty()))
}
