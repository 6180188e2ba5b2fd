//! Layout of the toolchain cache on disk.
//!
//! The default root is `nodekit` inside the platform cache directory
//! (`~/.cache/nodekit` on Linux), overridable with `NODEKIT_HOME` or an
//! explicit path.
//!
//! ## Directory Structure
//!
//! ```text
//! <root>/
//!   toolchains/
//!     node-v18.17.0-linux-x64/        # Ready toolchain
//!     .staging-node-v20.5.1-…-<n>/    # In-flight or orphaned install
//!   locks/
//!     node-v18.17.0-linux-x64.lock    # Per-key OS lock
//!     node-v18.17.0-linux-x64.owner   # Holder record while held
//!   index/
//!     index.json                      # Release index snapshot
//!     shasums/v18.17.0.txt            # Per-release checksum lists
//!   tmp/                              # Download scratch files
//! ```

use std::path::{Path, PathBuf};

use crate::errors::{ToolchainError, ToolchainResult};

/// Environment variable overriding the default cache root.
pub const NODEKIT_HOME_ENV: &str = "NODEKIT_HOME";

/// Prefix of staging directory names.
pub const STAGING_PREFIX: &str = ".staging-";

/// Paths of every directory the cache uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    /// Cache root.
    pub root: PathBuf,
    /// Installed toolchains and their staging directories.
    pub toolchains: PathBuf,
    /// Per-key lock files.
    pub locks: PathBuf,
    /// Release index snapshot and checksum lists.
    pub index: PathBuf,
    /// Download scratch space.
    pub tmp: PathBuf,
}

impl CacheLayout {
    /// Creates a layout rooted at `root`. Nothing is created on disk.
    #[must_use = "returns new layout without side effects"]
    pub fn new(root: PathBuf) -> Self {
        Self {
            toolchains: root.join("toolchains"),
            locks: root.join("locks"),
            index: root.join("index"),
            tmp: root.join("tmp"),
            root,
        }
    }

    /// Creates a layout for `override_root`, or the default root when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if no override is given and the platform cache
    /// directory cannot be determined.
    pub fn resolve(override_root: Option<&Path>) -> ToolchainResult<Self> {
        match override_root {
            Some(root) => Ok(Self::new(root.to_path_buf())),
            None => default_root().map(Self::new),
        }
    }

    /// Creates every directory of the layout.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure(&self) -> ToolchainResult<()> {
        for dir in [
            &self.toolchains,
            &self.locks,
            &self.index,
            &self.shasums_dir(),
            &self.tmp,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                ToolchainError::io(format!("creating cache directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Final directory of the toolchain named `dir_name`.
    #[must_use]
    pub fn entry_dir(&self, dir_name: &str) -> PathBuf {
        self.toolchains.join(dir_name)
    }

    /// Fresh staging directory for `dir_name`, tagged with `nonce`.
    #[must_use]
    pub fn staging_dir(&self, dir_name: &str, nonce: &str) -> PathBuf {
        self.toolchains
            .join(format!("{STAGING_PREFIX}{dir_name}-{nonce}"))
    }

    /// Lock file guarding `dir_name`.
    #[must_use]
    pub fn lock_file(&self, dir_name: &str) -> PathBuf {
        self.locks.join(format!("{dir_name}.lock"))
    }

    /// Owner record written by the holder of `dir_name`'s lock.
    #[must_use]
    pub fn owner_file(&self, dir_name: &str) -> PathBuf {
        self.locks.join(format!("{dir_name}.owner"))
    }

    /// Persisted release index snapshot.
    #[must_use]
    pub fn index_file(&self) -> PathBuf {
        self.index.join("index.json")
    }

    /// Directory of cached per-release checksum lists.
    #[must_use]
    pub fn shasums_dir(&self) -> PathBuf {
        self.index.join("shasums")
    }
}

/// Returns `NODEKIT_HOME` if set and non-empty, else the platform default.
///
/// # Errors
///
/// Returns an error if the platform cache directory cannot be determined.
pub fn default_root() -> ToolchainResult<PathBuf> {
    if let Ok(home) = std::env::var(NODEKIT_HOME_ENV)
        && !home.trim().is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    dirs::cache_dir()
        .map(|dir| dir.join("nodekit"))
        .ok_or_else(|| {
            ToolchainError::io(
                format!("cannot determine cache directory, set {NODEKIT_HOME_ENV}"),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })
}
