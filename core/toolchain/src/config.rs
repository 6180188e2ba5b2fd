//! Toolchain acquisition options.
//!
//! Options come from three layers, later layers winning:
//!
//! 1. a `nodekit.toml` file with a `[toolchain]` table,
//! 2. the environment (`NODEKIT_HOME`, `NODEKIT_MIRROR`),
//! 3. explicit overrides by the caller (CLI flags).
//!
//! ```toml
//! [toolchain]
//! node-version = ">=18 <21"
//! allow-system = false
//! mirror = "https://nodejs.org/dist"
//! index-ttl-secs = 3600
//! download-attempts = 3
//! lock-wait-timeout-secs = 600
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::download::RetryPolicy;
use crate::errors::{ToolchainError, ToolchainResult};
use crate::index::{DEFAULT_MIRROR, normalize_mirror};
use crate::lock::LockOptions;
use crate::paths::NODEKIT_HOME_ENV;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "nodekit.toml";

/// Environment variable overriding the distribution server.
pub const MIRROR_ENV: &str = "NODEKIT_MIRROR";

/// Options controlling resolution, download and locking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ToolchainOptions {
    /// Requirement used when the caller gives none.
    pub node_version: Option<String>,
    /// Cache root; the platform default when unset.
    pub cache_dir: Option<PathBuf>,
    /// Whether a satisfying system `node` may be used.
    pub allow_system: bool,
    /// System `node` to probe instead of searching `PATH`.
    pub node_executable: Option<PathBuf>,
    /// Restrict open ranges to LTS releases.
    pub lts_only: bool,
    /// Distribution server base URL.
    pub mirror: String,
    /// Release index time-to-live.
    pub index_ttl_secs: u64,
    /// Download attempts per archive, including the first.
    pub download_attempts: u32,
    /// Base retry delay; doubled on every retry.
    pub download_retry_base_ms: u64,
    /// Per-attempt request timeout.
    pub download_timeout_secs: u64,
    /// Give up waiting for a cache lock after this long.
    pub lock_wait_timeout_secs: Option<u64>,
    /// How long a lock may stay held by a dead process before waiters fail.
    pub lock_dead_holder_grace_secs: u64,
}

impl Default for ToolchainOptions {
    fn default() -> Self {
        Self {
            node_version: None,
            cache_dir: None,
            allow_system: true,
            node_executable: None,
            lts_only: false,
            mirror: DEFAULT_MIRROR.to_string(),
            index_ttl_secs: 3600,
            download_attempts: 3,
            download_retry_base_ms: 1000,
            download_timeout_secs: 300,
            lock_wait_timeout_secs: None,
            lock_dead_holder_grace_secs: 60,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    toolchain: ToolchainOptions,
}

impl ToolchainOptions {
    /// Parses options from the contents of a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the TOML is invalid or has unknown keys.
    pub fn from_toml(content: &str, path: &Path) -> ToolchainResult<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| ToolchainError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(file.toolchain)
    }

    /// Reads options from a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Config` if it is invalid.
    pub fn from_file(path: &Path) -> ToolchainResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ToolchainError::io(format!("reading config {}", path.display()), e)
        })?;
        Self::from_toml(&content, path)
    }

    /// Loads options from `path`, or from `nodekit.toml` in `dir` if present,
    /// then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named or discovered file is invalid.
    pub fn load(path: Option<&Path>, dir: &Path) -> ToolchainResult<Self> {
        let options = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let candidate = dir.join(CONFIG_FILE);
                if candidate.is_file() {
                    debug!(path = %candidate.display(), "loading config");
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(options.with_env())
    }

    /// Applies `NODEKIT_HOME` and `NODEKIT_MIRROR`. Blank values are ignored.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(home) = non_blank_env(NODEKIT_HOME_ENV) {
            self.cache_dir = Some(PathBuf::from(home));
        }
        if let Some(mirror) = non_blank_env(MIRROR_ENV) {
            self.mirror = mirror;
        }
        self.mirror = normalize_mirror(&self.mirror);
        self
    }

    /// Index time-to-live.
    #[must_use]
    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_secs)
    }

    /// Download retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.download_attempts.max(1),
            base_delay: Duration::from_millis(self.download_retry_base_ms),
            request_timeout: Duration::from_secs(self.download_timeout_secs),
        }
    }

    /// Cache lock policy.
    #[must_use]
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            wait_timeout: self.lock_wait_timeout_secs.map(Duration::from_secs),
            dead_holder_grace: Duration::from_secs(self.lock_dead_holder_grace_secs),
            ..LockOptions::default()
        }
    }
}

fn non_blank_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
