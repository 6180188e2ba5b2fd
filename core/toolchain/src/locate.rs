//! Locating `node`, `npm` and `npx`.
//!
//! Two contexts are supported:
//!
//! 1. **Cached toolchains** - [`locate`] looks up each tool in the platform
//!    [`Layout`](crate::platform::Layout) table relative to the toolchain root.
//! 2. **System installations** - [`detect_system`] finds `node` on `PATH` (or
//!    at an explicit path), asks it for its version, and looks for `npm` and
//!    `npx` next to it or on `PATH`. It never downloads anything.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use tracing::debug;

use crate::errors::{ToolchainError, ToolchainResult};
use crate::platform::{Platform, Tool};
use crate::version_spec::VersionSpec;

/// How long `node --version` may take.
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Paths of the three toolchain executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executables {
    /// The `node` runtime.
    pub node: PathBuf,
    /// The `npm` package manager.
    pub npm: PathBuf,
    /// The `npx` runner.
    pub npx: PathBuf,
}

/// A usable `node` installation outside the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemToolchain {
    /// Its executables.
    pub executables: Executables,
    /// Version reported by `node --version`.
    pub version: Version,
}

/// Finds every tool inside the toolchain at `root`.
///
/// # Errors
///
/// Returns `ExecutableNotFound` naming the first missing tool.
pub fn locate(root: &Path, platform: Platform) -> ToolchainResult<Executables> {
    let layout = platform.layout();
    let find = |tool: Tool| {
        layout
            .candidates(tool)
            .iter()
            .map(|candidate| root.join(candidate))
            .find(|path| path.is_file())
            .ok_or_else(|| ToolchainError::executable_not_found(tool.as_str(), root))
    };

    Ok(Executables {
        node: find(Tool::Node)?,
        npm: find(Tool::Npm)?,
        npx: find(Tool::Npx)?,
    })
}

/// Looks for a system `node` satisfying `spec`, searching `PATH` unless
/// `node_executable` names one.
///
/// Returns `None` when there is no such installation; every reason is logged
/// at debug level.
pub async fn detect_system(
    spec: &VersionSpec,
    node_executable: Option<&Path>,
) -> Option<SystemToolchain> {
    detect_system_in(spec, node_executable, std::env::var_os("PATH")).await
}

/// [`detect_system`] with an explicit search path.
pub async fn detect_system_in(
    spec: &VersionSpec,
    node_executable: Option<&Path>,
    search_path: Option<OsString>,
) -> Option<SystemToolchain> {
    if spec.is_tag() {
        debug!(spec = %spec, "tags are resolved through the release index only");
        return None;
    }

    let platform = Platform::detect().ok()?;
    let cwd = std::env::current_dir().ok()?;

    let node = match node_executable {
        Some(path) if path.is_file() => path.to_path_buf(),
        Some(path) => {
            debug!(path = %path.display(), "configured node executable does not exist");
            return None;
        }
        None => match which::which_in("node", search_path.as_ref(), &cwd) {
            Ok(path) => path,
            Err(_) => {
                debug!("no node on PATH");
                return None;
            }
        },
    };

    let version = probe_version(&node).await?;
    if !spec.is_satisfied_by_local(&version) {
        debug!(
            node = %node.display(),
            version = %version,
            spec = %spec,
            "system node does not satisfy spec"
        );
        return None;
    }

    let npm = find_companion(&node, platform, Tool::Npm, search_path.as_ref(), &cwd)?;
    let npx = find_companion(&node, platform, Tool::Npx, search_path.as_ref(), &cwd)?;

    debug!(node = %node.display(), version = %version, "using system node");
    Some(SystemToolchain {
        executables: Executables { node, npm, npx },
        version,
    })
}

/// Finds `tool` next to `node`, falling back to `PATH`.
fn find_companion(
    node: &Path,
    platform: Platform,
    tool: Tool,
    search_path: Option<&OsString>,
    cwd: &Path,
) -> Option<PathBuf> {
    let dir = node.parent()?;
    let sibling = platform
        .layout()
        .candidates(tool)
        .iter()
        .filter_map(|candidate| Path::new(candidate).file_name())
        .map(|name| dir.join(name))
        .find(|path| path.is_file());
    if sibling.is_some() {
        return sibling;
    }

    match which::which_in(tool.as_str(), search_path, cwd) {
        Ok(path) => Some(path),
        Err(_) => {
            debug!(
                tool = tool.as_str(),
                node = %node.display(),
                "system node has no companion tool"
            );
            None
        }
    }
}

/// Runs `node --version` and parses its output.
async fn probe_version(node: &Path) -> Option<Version> {
    let probe = tokio::process::Command::new(node)
        .arg("--version")
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(node = %node.display(), error = %e, "failed to run node --version");
            return None;
        }
        Err(_) => {
            debug!(node = %node.display(), "node --version timed out");
            return None;
        }
    };

    if !output.status.success() {
        debug!(node = %node.display(), status = %output.status, "node --version failed");
        return None;
    }

    parse_node_version(&String::from_utf8_lossy(&output.stdout))
}

/// Parses `node --version` output such as `v18.17.0\n`.
#[must_use]
pub fn parse_node_version(output: &str) -> Option<Version> {
    let text = output.trim();
    Version::parse(text.strip_prefix('v').unwrap_or(text)).ok()
}
