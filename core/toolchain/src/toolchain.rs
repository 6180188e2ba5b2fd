//! Toolchain acquisition entry point.
//!
//! [`Toolchain`] wires the release index, resolver, downloader and cache store
//! together for one cache root. [`acquire_toolchain`] is the one-call form used
//! by build scripts that need no options beyond the defaults.
//!
//! ## Acquisition order
//!
//! 1. A satisfying system `node`, when allowed (no network).
//! 2. An exact version already in the cache (no network).
//! 3. Index resolution, then download and install on a cache miss.
//!
//! When the index cannot be reached, the highest cached version satisfying a
//! non-tag spec is used instead.
//!
//! A cached entry that turns out to be missing executables is invalidated and
//! installed again once.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, CacheState, CacheStore};
use crate::config::ToolchainOptions;
use crate::download::Downloader;
use crate::errors::{ToolchainError, ToolchainResult};
use crate::index::ReleaseIndex;
use crate::locate::{Executables, SystemToolchain, detect_system, locate};
use crate::lock::{FileLocker, KeyLocker};
use crate::paths::CacheLayout;
use crate::platform::HostTarget;
use crate::resolver::{ReleaseDescriptor, Resolution, VersionSpecResolver};
use crate::version_spec::VersionSpec;

/// Where a handle's executables come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolchainSource {
    /// A toolchain installed in the cache.
    Cache,
    /// An installation found on the system.
    System,
}

impl ToolchainSource {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::System => "system",
        }
    }
}

/// Resolved executable paths of a usable toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainHandle {
    /// The `node` runtime.
    pub node: PathBuf,
    /// The `npm` package manager.
    pub npm: PathBuf,
    /// The `npx` runner.
    pub npx: PathBuf,
    /// Node.js version.
    pub version: Version,
    /// Cache or system.
    pub source: ToolchainSource,
    /// Toolchain root; for system installations, the directory of `node`.
    pub root: PathBuf,
}

impl ToolchainHandle {
    fn from_cache(entry: &CacheEntry, executables: Executables) -> Self {
        Self {
            node: executables.node,
            npm: executables.npm,
            npx: executables.npx,
            version: entry.key.version.clone(),
            source: ToolchainSource::Cache,
            root: entry.root.clone(),
        }
    }

    fn from_system(system: SystemToolchain) -> Self {
        let root = system
            .executables
            .node
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            node: system.executables.node,
            npm: system.executables.npm,
            npx: system.executables.npx,
            version: system.version,
            source: ToolchainSource::System,
            root,
        }
    }

    /// Directory holding `node`.
    #[must_use]
    pub fn bin_dir(&self) -> &Path {
        self.node.parent().unwrap_or(&self.root)
    }

    /// Replaces `{node}`, `{npm}` and `{npx}` in every argument with the
    /// handle's paths.
    #[must_use]
    pub fn expand_command<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let node = self.node.to_string_lossy();
        let npm = self.npm.to_string_lossy();
        let npx = self.npx.to_string_lossy();
        args.iter()
            .map(|arg| {
                arg.as_ref()
                    .replace("{node}", &node)
                    .replace("{npm}", &npm)
                    .replace("{npx}", &npx)
            })
            .collect()
    }

    /// `PATH` of the current process with [`bin_dir`](Self::bin_dir)
    /// prepended.
    ///
    /// # Errors
    ///
    /// Returns an error if a path contains the platform's separator.
    pub fn path_env(&self) -> ToolchainResult<OsString> {
        self.path_env_with(std::env::var_os("PATH"))
    }

    /// [`path_env`](Self::path_env) over an explicit existing value.
    ///
    /// # Errors
    ///
    /// Returns an error if a path contains the platform's separator.
    pub fn path_env_with(&self, existing: Option<OsString>) -> ToolchainResult<OsString> {
        let mut dirs = vec![self.bin_dir().to_path_buf()];
        if let Some(existing) = existing {
            dirs.extend(std::env::split_paths(&existing));
        }
        std::env::join_paths(dirs)
            .map_err(|e| ToolchainError::io("building PATH", std::io::Error::other(e)))
    }
}

/// Acquires toolchains into one cache root.
pub struct Toolchain<L: KeyLocker = FileLocker> {
    options: ToolchainOptions,
    target: HostTarget,
    index: ReleaseIndex,
    downloader: Downloader,
    store: CacheStore<L>,
}

impl Toolchain<FileLocker> {
    /// Creates a toolchain manager with cross-process file locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is unsupported, the cache root cannot be
    /// determined, or the HTTP client cannot be created.
    pub fn new(options: ToolchainOptions) -> ToolchainResult<Self> {
        let layout = CacheLayout::resolve(options.cache_dir.as_deref())?;
        let locker = FileLocker::new(layout.clone(), options.lock_options());
        Self::with_locker(options, locker)
    }
}

impl<L: KeyLocker> Toolchain<L> {
    /// Creates a toolchain manager with an explicit locker.
    ///
    /// # Errors
    ///
    /// See [`Toolchain::new`].
    pub fn with_locker(options: ToolchainOptions, locker: L) -> ToolchainResult<Self> {
        let target = HostTarget::detect()?;
        let layout = CacheLayout::resolve(options.cache_dir.as_deref())?;
        let index = ReleaseIndex::new(&layout, &options.mirror, options.index_ttl())?;
        let downloader = Downloader::new(layout.tmp.clone(), options.retry_policy())?;
        debug!(
            root = %layout.root.display(),
            mirror = %index.mirror(),
            target = %target,
            "toolchain manager ready"
        );
        Ok(Self {
            options,
            target,
            index,
            downloader,
            store: CacheStore::new(layout, locker),
        })
    }

    /// Options this manager was built with.
    #[must_use]
    pub fn options(&self) -> &ToolchainOptions {
        &self.options
    }

    /// The host target toolchains are acquired for.
    #[must_use]
    pub fn target(&self) -> HostTarget {
        self.target
    }

    /// The cache store.
    #[must_use]
    pub fn store(&self) -> &CacheStore<L> {
        &self.store
    }

    /// The release index.
    #[must_use]
    pub fn index(&self) -> &ReleaseIndex {
        &self.index
    }

    fn resolver(&self) -> VersionSpecResolver<'_> {
        VersionSpecResolver::new(&self.index, self.target)
            .lts_only(self.options.lts_only)
            .node_executable(self.options.node_executable.clone())
    }

    /// Resolves `spec` without downloading anything.
    ///
    /// # Errors
    ///
    /// See [`VersionSpecResolver::resolve`].
    pub async fn resolve(
        &self,
        spec: &VersionSpec,
        allow_system: bool,
    ) -> ToolchainResult<Resolution> {
        self.resolver().resolve(spec, allow_system).await
    }

    /// Returns a usable toolchain for `spec`, installing it if needed.
    ///
    /// # Errors
    ///
    /// Propagates resolution, download, verification, extraction and lock
    /// failures. No other version is tried when the resolved one fails.
    pub async fn acquire(
        &self,
        spec: &VersionSpec,
        allow_system: bool,
    ) -> ToolchainResult<ToolchainHandle> {
        if allow_system
            && let Some(system) =
                detect_system(spec, self.options.node_executable.as_deref()).await
        {
            info!(
                version = %system.version,
                node = %system.executables.node.display(),
                "using system toolchain"
            );
            return Ok(ToolchainHandle::from_system(system));
        }

        if let Some(version) = spec.exact() {
            let key = CacheKey::for_target(version.clone(), self.target);
            if let Some(entry) = self.store.lookup(&key) {
                debug!(key = %key, "exact version already cached");
                let executables = locate(&entry.root, key.platform)?;
                return Ok(ToolchainHandle::from_cache(&entry, executables));
            }
        }

        let descriptor = match self.resolver().resolve_release(spec).await {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_transient() => {
                let Some(handle) = self.cached_match(spec) else {
                    return Err(e);
                };
                warn!(
                    spec = %spec,
                    version = %handle.version,
                    error = %e,
                    "release index unreachable, using cached toolchain"
                );
                return Ok(handle);
            }
            Err(e) => return Err(e),
        };
        self.install(&descriptor).await
    }

    /// Highest ready cached toolchain for this host that satisfies `spec`.
    fn cached_match(&self, spec: &VersionSpec) -> Option<ToolchainHandle> {
        let entries = match self.store.list() {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "cannot list cache");
                return None;
            }
        };
        let entry = entries
            .into_iter()
            .filter(|e| e.state == CacheState::Ready && e.key.target() == self.target)
            .filter(|e| spec.is_satisfied_by_local(&e.key.version))
            .max_by(|a, b| a.key.version.cmp(&b.key.version))?;
        let executables = locate(&entry.root, entry.key.platform).ok()?;
        Some(ToolchainHandle::from_cache(&entry, executables))
    }

    async fn install(&self, descriptor: &ReleaseDescriptor) -> ToolchainResult<ToolchainHandle> {
        let entry = self.store.acquire(descriptor, &self.downloader).await?;
        match locate(&entry.root, descriptor.platform()) {
            Ok(executables) => Ok(ToolchainHandle::from_cache(&entry, executables)),
            Err(e) if e.is_cache_corruption() => {
                warn!(key = %entry.key, error = %e, "cached toolchain is damaged, reinstalling");
                self.store.invalidate(&entry.key).await?;
                let entry = self.store.acquire(descriptor, &self.downloader).await?;
                let executables = locate(&entry.root, descriptor.platform())?;
                Ok(ToolchainHandle::from_cache(&entry, executables))
            }
            Err(e) => Err(e),
        }
    }

    /// Every toolchain directory in the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    pub fn list(&self) -> ToolchainResult<Vec<CacheEntry>> {
        self.store.list()
    }

    /// Removes the host's cached toolchain for `version`. Returns whether one
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the entry cannot be
    /// removed.
    pub async fn invalidate(&self, version: &Version) -> ToolchainResult<bool> {
        let key = CacheKey::for_target(version.clone(), self.target);
        self.store.invalidate(&key).await
    }

    /// Removes orphaned staging directories. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// See [`CacheStore::sweep_staging`].
    pub async fn sweep_staging(&self) -> ToolchainResult<usize> {
        self.store.sweep_staging().await
    }
}

/// Acquires a toolchain for `version_spec` with default options.
///
/// `NODEKIT_HOME` and `NODEKIT_MIRROR` are honoured; `cache_root_override`
/// wins over `NODEKIT_HOME`.
///
/// # Errors
///
/// Returns `InvalidVersionSpec` for an unparsable spec, and otherwise see
/// [`Toolchain::acquire`].
pub async fn acquire_toolchain(
    version_spec: &str,
    allow_system_fallback: bool,
    cache_root_override: Option<&Path>,
) -> ToolchainResult<ToolchainHandle> {
    let spec = VersionSpec::parse(version_spec)?;
    let mut options = ToolchainOptions::default().with_env();
    if let Some(root) = cache_root_override {
        options.cache_dir = Some(root.to_path_buf());
    }
    Toolchain::new(options)?
        .acquire(&spec, allow_system_fallback)
        .await
}
