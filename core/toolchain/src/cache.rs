//! Durable, key-addressed store of extracted toolchains.
//!
//! A toolchain lives at `toolchains/node-v<version>-<platform>-<arch>/` and
//! only ever appears there through a directory rename: archives are extracted
//! into a sibling `.staging-<key>-<nonce>` directory, validated, and then
//! renamed into place. A reader that sees the final directory therefore sees a
//! complete toolchain.
//!
//! Installs of one key are serialised through a [`KeyLocker`]. While holding
//! the lock, any staging directory for the key is known to be orphaned (its
//! installer died) and is removed before installing.

use std::fmt;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::{debug, info, warn};

use crate::archive;
use crate::download::Downloader;
use crate::errors::{ToolchainError, ToolchainResult};
use crate::locate::locate;
use crate::lock::{FileLocker, HeldLock, KeyLocker};
use crate::paths::{CacheLayout, STAGING_PREFIX};
use crate::platform::{Arch, HostTarget, Platform};
use crate::resolver::ReleaseDescriptor;

/// Identity of an installed toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Node.js version.
    pub version: Version,
    /// Operating system family.
    pub platform: Platform,
    /// CPU architecture.
    pub arch: Arch,
}

impl CacheKey {
    /// Creates a key from its parts.
    #[must_use]
    pub fn new(version: Version, platform: Platform, arch: Arch) -> Self {
        Self {
            version,
            platform,
            arch,
        }
    }

    /// Creates a key for `version` on `target`.
    #[must_use]
    pub fn for_target(version: Version, target: HostTarget) -> Self {
        Self::new(version, target.platform, target.arch)
    }

    /// The target this key was built for.
    #[must_use]
    pub fn target(&self) -> HostTarget {
        HostTarget::new(self.platform, self.arch)
    }

    /// Directory name, e.g. `node-v18.17.0-linux-x64`.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("node-v{}-{}-{}", self.version, self.platform, self.arch)
    }

    /// Parses a name produced by [`CacheKey::dir_name`].
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("node-v")?;
        let mut parts = rest.rsplitn(3, '-');
        let arch = Arch::from_key(parts.next()?)?;
        let platform = Platform::from_key(parts.next()?)?;
        let version = Version::parse(parts.next()?).ok()?;
        Some(Self::new(version, platform, arch))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// A staging directory: an install in flight or abandoned.
    Installing,
    /// Extracted, validated and renamed into place.
    Ready,
    /// A final directory that is missing executables.
    Corrupt,
}

impl CacheState {
    /// Lowercase name for display.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Ready => "ready",
            Self::Corrupt => "corrupt",
        }
    }
}

/// One toolchain directory under the cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Which toolchain this is.
    pub key: CacheKey,
    /// Directory holding it.
    pub root: PathBuf,
    /// Its state.
    pub state: CacheState,
}

/// Store of installed toolchains under one cache root.
#[derive(Debug, Clone)]
pub struct CacheStore<L: KeyLocker = FileLocker> {
    layout: CacheLayout,
    locker: L,
}

impl<L: KeyLocker> CacheStore<L> {
    /// Creates a store with an explicit locker.
    #[must_use]
    pub fn new(layout: CacheLayout, locker: L) -> Self {
        Self { layout, locker }
    }

    /// The directory layout of this store.
    #[must_use]
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Returns the ready entry for `key`, if any.
    ///
    /// Pure read: a missing directory or one lacking executables yields `None`.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let root = self.layout.entry_dir(&key.dir_name());
        if !root.is_dir() {
            return None;
        }
        match locate(&root, key.platform) {
            Ok(_) => Some(CacheEntry {
                key: key.clone(),
                root,
                state: CacheState::Ready,
            }),
            Err(e) => {
                debug!(key = %key, error = %e, "cache entry present but unusable");
                None
            }
        }
    }

    /// Returns a ready entry for `descriptor`, installing it if needed.
    ///
    /// # Errors
    ///
    /// Propagates lock, download, verification and extraction failures. On
    /// failure no final directory is created and the staging directory is
    /// removed.
    pub async fn acquire(
        &self,
        descriptor: &ReleaseDescriptor,
        downloader: &Downloader,
    ) -> ToolchainResult<CacheEntry> {
        let key = descriptor.key();
        if let Some(entry) = self.lookup(&key) {
            debug!(key = %key, "cache hit");
            return Ok(entry);
        }

        let guard = self.locker.lock(&key).await?;
        if guard.previous_holder_died() {
            warn!(key = %key, "recovering from interrupted install");
        }

        if let Some(entry) = self.lookup(&key) {
            debug!(key = %key, "installed by another holder while waiting");
            return Ok(entry);
        }

        debug!(key = %key, "cache miss");
        let result = self.install(&key, descriptor, downloader).await;
        drop(guard);
        result
    }

    async fn install(
        &self,
        key: &CacheKey,
        descriptor: &ReleaseDescriptor,
        downloader: &Downloader,
    ) -> ToolchainResult<CacheEntry> {
        self.layout.ensure()?;
        let name = key.dir_name();
        self.sweep_key_staging(&name);

        let archive = downloader.fetch(descriptor).await?;
        let staging = self.layout.staging_dir(&name, &random_nonce());

        debug!(
            key = %key,
            url = archive.url(),
            sha256 = archive.sha256(),
            size = archive.size(),
            staging = %staging.display(),
            "extracting archive"
        );

        let archive_path = archive.path().to_path_buf();
        let extract_into = staging.clone();
        let platform = descriptor.platform();
        let format = descriptor.archive_format();
        let extracted = tokio::task::spawn_blocking(move || {
            archive::extract(&archive_path, &extract_into, format, platform)
        })
        .await
        .map_err(|e| ToolchainError::io("extraction task failed", std::io::Error::other(e)))
        .and_then(|result| result);
        drop(archive);

        let result = extracted.and_then(|()| self.commit(key, &staging));
        if result.is_err() {
            remove_dir_logged(&staging);
        }
        result
    }

    /// Validates `staging` and renames it into the key's final slot.
    fn commit(&self, key: &CacheKey, staging: &Path) -> ToolchainResult<CacheEntry> {
        locate(staging, key.platform)?;

        let name = key.dir_name();
        let root = self.layout.entry_dir(&name);
        if root.exists() {
            warn!(key = %key, path = %root.display(), "replacing corrupt cache entry");
            self.move_aside(&name, &root)?;
        }

        std::fs::rename(staging, &root).map_err(|e| {
            ToolchainError::io(
                format!("renaming {} to {}", staging.display(), root.display()),
                e,
            )
        })?;

        info!(key = %key, path = %root.display(), "installed toolchain");
        Ok(CacheEntry {
            key: key.clone(),
            root,
            state: CacheState::Ready,
        })
    }

    /// Removes the final directory for `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the directory cannot be
    /// moved aside.
    pub async fn invalidate(&self, key: &CacheKey) -> ToolchainResult<bool> {
        let _guard = self.locker.lock(key).await?;
        let name = key.dir_name();
        let root = self.layout.entry_dir(&name);
        if !root.exists() {
            return Ok(false);
        }
        self.move_aside(&name, &root)?;
        info!(key = %key, "invalidated cache entry");
        Ok(true)
    }

    /// Lists every toolchain directory, including staging directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the toolchains directory exists but cannot be read.
    pub fn list(&self) -> ToolchainResult<Vec<CacheEntry>> {
        let dir = &self.layout.toolchains;
        let read = match std::fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ToolchainError::io(format!("reading {}", dir.display()), e)),
        };

        let mut entries = Vec::new();
        for item in read {
            let item =
                item.map_err(|e| ToolchainError::io(format!("reading {}", dir.display()), e))?;
            let root = item.path();
            if !root.is_dir() {
                continue;
            }
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };

            if let Some(staged) = name.strip_prefix(STAGING_PREFIX) {
                if let Some(key) = staged.rsplit_once('-').and_then(|(n, _)| CacheKey::parse(n)) {
                    entries.push(CacheEntry {
                        key,
                        root,
                        state: CacheState::Installing,
                    });
                }
                continue;
            }

            if let Some(key) = CacheKey::parse(&name) {
                let state = if locate(&root, key.platform).is_ok() {
                    CacheState::Ready
                } else {
                    CacheState::Corrupt
                };
                entries.push(CacheEntry { key, root, state });
            }
        }

        entries.sort_by(|a, b| {
            a.key
                .version
                .cmp(&b.key.version)
                .then_with(|| a.key.dir_name().cmp(&b.key.dir_name()))
                .then_with(|| a.root.cmp(&b.root))
        });
        Ok(entries)
    }

    /// Removes orphaned staging directories for every key. Each key's lock is
    /// taken first, so in-flight installs are waited for, not disturbed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be listed or a lock cannot be
    /// taken.
    pub async fn sweep_staging(&self) -> ToolchainResult<usize> {
        let mut keys: Vec<CacheKey> = self
            .list()?
            .into_iter()
            .filter(|e| e.state == CacheState::Installing)
            .map(|e| e.key)
            .collect();
        keys.dedup();

        let mut removed = 0;
        for key in keys {
            let _guard = self.locker.lock(&key).await?;
            removed += self.sweep_key_staging(&key.dir_name());
        }
        Ok(removed)
    }

    /// Removes staging directories of `name`. Caller must hold its lock.
    fn sweep_key_staging(&self, name: &str) -> usize {
        let prefix = format!("{STAGING_PREFIX}{name}-");
        let Ok(read) = std::fs::read_dir(&self.layout.toolchains) else {
            return 0;
        };

        let mut removed = 0;
        for item in read.flatten() {
            let is_ours = item
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix));
            if is_ours {
                warn!(path = %item.path().display(), "removing orphaned staging directory");
                if remove_dir_logged(&item.path()) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Renames `root` to a staging name, then deletes it.
    fn move_aside(&self, name: &str, root: &Path) -> ToolchainResult<()> {
        let aside = self
            .layout
            .staging_dir(name, &format!("removed{}", random_nonce()));
        std::fs::rename(root, &aside).map_err(|e| {
            ToolchainError::io(format!("moving {} aside", root.display()), e)
        })?;
        remove_dir_logged(&aside);
        Ok(())
    }
}

fn remove_dir_logged(path: &Path) -> bool {
    match std::fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove directory");
            false
        }
    }
}

fn random_nonce() -> String {
    let bytes: [u8; 6] = rand::random();
    hex::encode(bytes)
}
