//! Resolution of a version spec to something runnable.
//!
//! Resolution prefers, in order:
//!
//! 1. **A system installation** - when allowed and the spec is not a tag, a
//!    `node` on `PATH` (or at the configured path) that satisfies the spec is
//!    used as is. No network access happens.
//! 2. **A published release** - the highest release in the index matching the
//!    spec with a build for the running host, described by a
//!    [`ReleaseDescriptor`] that carries the archive URL and its checksum.

use std::path::PathBuf;
use std::time::Duration;

use semver::Version;
use tracing::debug;

use crate::cache::CacheKey;
use crate::errors::{ToolchainError, ToolchainResult};
use crate::index::{IndexSnapshot, ReleaseEntry, ReleaseIndex};
use crate::locate::{SystemToolchain, detect_system};
use crate::platform::{ArchiveFormat, HostTarget, Platform};
use crate::version_spec::VersionSpec;

/// A pinned version missing from an index older than this triggers a refresh.
const EXACT_MISS_REFRESH_AGE: Duration = Duration::from_secs(60);

/// Digest algorithm of a published checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    /// SHA-256, as listed in `SHASUMS256.txt`.
    Sha256,
}

impl ChecksumAlgorithm {
    /// Lowercase algorithm name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }
}

/// One downloadable build of one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    /// Release version.
    pub version: Version,
    /// Platform and architecture of the build.
    pub target: HostTarget,
    /// Archive file name, e.g. `node-v18.17.0-linux-x64.tar.gz`.
    pub archive_name: String,
    /// Full download URL.
    pub archive_url: String,
    /// Lowercase hex digest of the archive.
    pub checksum: String,
    /// Algorithm of `checksum`.
    pub checksum_algorithm: ChecksumAlgorithm,
    /// LTS codename, if any.
    pub lts: Option<String>,
}

impl ReleaseDescriptor {
    /// Cache key of the toolchain this archive installs.
    #[must_use]
    pub fn key(&self) -> CacheKey {
        CacheKey::for_target(self.version.clone(), self.target)
    }

    /// Platform of the build.
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.target.platform
    }

    /// Format of the archive.
    #[must_use]
    pub fn archive_format(&self) -> ArchiveFormat {
        self.target.platform.archive_format()
    }
}

/// Outcome of resolving a spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A release to install (or already cached).
    Release(ReleaseDescriptor),
    /// A satisfying installation already on the system.
    System(SystemToolchain),
}

/// Resolves specs against a release index and the local system.
pub struct VersionSpecResolver<'a> {
    index: &'a ReleaseIndex,
    target: HostTarget,
    lts_only: bool,
    node_executable: Option<PathBuf>,
}

impl<'a> VersionSpecResolver<'a> {
    /// Creates a resolver for `target` backed by `index`.
    #[must_use]
    pub fn new(index: &'a ReleaseIndex, target: HostTarget) -> Self {
        Self {
            index,
            target,
            lts_only: false,
            node_executable: None,
        }
    }

    /// Restricts open ranges to LTS releases.
    #[must_use]
    pub fn lts_only(mut self, lts_only: bool) -> Self {
        self.lts_only = lts_only;
        self
    }

    /// Probes `path` instead of searching `PATH` for a system `node`.
    #[must_use]
    pub fn node_executable(mut self, path: Option<PathBuf>) -> Self {
        self.node_executable = path;
        self
    }

    /// Resolves `spec`, trying a system installation first when
    /// `allow_system` is set.
    ///
    /// # Errors
    ///
    /// - `UnresolvableVersion` if no release matches for this host
    /// - `IndexUnavailable` if the index cannot be fetched and none is cached
    /// - `ChecksumMissing` if the release does not list the archive
    pub async fn resolve(
        &self,
        spec: &VersionSpec,
        allow_system: bool,
    ) -> ToolchainResult<Resolution> {
        if allow_system
            && let Some(system) = detect_system(spec, self.node_executable.as_deref()).await
        {
            return Ok(Resolution::System(system));
        }
        self.resolve_release(spec).await.map(Resolution::Release)
    }

    /// Resolves `spec` against the release index only.
    ///
    /// # Errors
    ///
    /// See [`VersionSpecResolver::resolve`].
    pub async fn resolve_release(&self, spec: &VersionSpec) -> ToolchainResult<ReleaseDescriptor> {
        let snapshot = self.index.snapshot(false).await?;
        let entry = match self.pick(&snapshot, spec) {
            Some(entry) => entry,
            // A pinned version newer than the cached index may have been
            // published since the last refresh.
            None if spec.exact().is_some() && !snapshot.is_fresh(EXACT_MISS_REFRESH_AGE) => {
                debug!(spec = %spec, "exact version missing from cached index, refreshing");
                let refreshed = self.index.snapshot(true).await?;
                self.pick(&refreshed, spec).ok_or_else(|| {
                    ToolchainError::unresolvable(spec.to_string(), self.target.to_string())
                })?
            }
            None => {
                return Err(ToolchainError::unresolvable(
                    spec.to_string(),
                    self.target.to_string(),
                ));
            }
        };

        let archive_name = self.target.archive_name(&entry.version);
        let checksum = self.index.checksum(&entry.version, &archive_name).await?;
        let archive_url = self.index.release_url(&entry.version, &archive_name);

        debug!(spec = %spec, version = %entry.version, url = %archive_url, "resolved release");
        Ok(ReleaseDescriptor {
            version: entry.version,
            target: self.target,
            archive_name,
            archive_url,
            checksum,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            lts: entry.lts,
        })
    }

    fn pick(&self, snapshot: &IndexSnapshot, spec: &VersionSpec) -> Option<ReleaseEntry> {
        snapshot
            .best_match(spec, self.target, self.lts_only)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::CacheLayout;
    use crate::platform::Arch;

    const TARGET: HostTarget = HostTarget::new(Platform::Linux, Arch::X64);

    const MANIFEST: &str = r#"[
        {"version": "v20.9.0", "files": ["linux-x64"], "lts": "Iron"},
        {"version": "v18.18.2", "files": ["linux-x64"], "lts": "Hydrogen"},
        {"version": "v18.17.0", "files": ["linux-x64"], "lts": "Hydrogen"}
    ]"#;

    /// Seeds a fresh index snapshot and checksum lists so nothing touches
    /// the network.
    fn seeded_index(root: &std::path::Path, with_shasums: bool) -> ReleaseIndex {
        let layout = CacheLayout::new(root.to_path_buf());
        layout.ensure().expect("Should create layout");

        let snapshot = IndexSnapshot::new(
            IndexSnapshot::parse_manifest(MANIFEST).expect("Should parse manifest"),
        );
        std::fs::write(
            layout.index_file(),
            serde_json::to_string(&snapshot).expect("Should encode snapshot"),
        )
        .expect("Should write snapshot");

        if with_shasums {
            for version in ["20.9.0", "18.18.2", "18.17.0"] {
                std::fs::write(
                    layout.shasums_dir().join(format!("v{version}.txt")),
                    format!(
                        "{:064x}  node-v{version}-linux-x64.tar.gz\n\
                         {:064x}  node-v{version}-win-x64.zip\n",
                        1, 2
                    ),
                )
                .expect("Should write shasums");
            }
        }

        ReleaseIndex::new(&layout, "http://127.0.0.1:9/dist", Duration::from_secs(3600))
            .expect("Should create index")
    }

    fn spec(s: &str) -> VersionSpec {
        VersionSpec::parse(s).expect("Should parse spec")
    }

    #[tokio::test]
    async fn resolves_descriptor_with_url_and_checksum() {
        let temp = tempfile::tempdir().expect("Should create temp dir");
        let index = seeded_index(temp.path(), true);
        let resolver = VersionSpecResolver::new(&index, TARGET);

        let descriptor = resolver
            .resolve_release(&spec("^18"))
            .await
            .expect("Should resolve");

        assert_eq!(descriptor.version, Version::new(18, 18, 2));
        assert_eq!(descriptor.archive_name, "node-v18.18.2-linux-x64.tar.gz");
        assert_eq!(
            descriptor.archive_url,
            "http://127.0.0.1:9/dist/v18.18.2/node-v18.18.2-linux-x64.tar.gz"
        );
        assert_eq!(descriptor.checksum, format!("{:064x}", 1));
        assert_eq!(descriptor.checksum_algorithm.as_str(), "sha256");
        assert_eq!(descriptor.lts.as_deref(), Some("Hydrogen"));
        assert_eq!(descriptor.key().dir_name(), "node-v18.18.2-linux-x64");
    }

    #[tokio::test]
    async fn unmatched_spec_names_spec_and_target() {
        let temp = tempfile::tempdir().expect("Should create temp dir");
        let index = seeded_index(temp.path(), true);
        let resolver = VersionSpecResolver::new(&index, TARGET);

        let err = resolver
            .resolve(&spec("^22"), false)
            .await
            .expect_err("Should not resolve");
        assert_eq!(
            err.to_string(),
            "no Node.js release satisfies '^22' for linux-x64"
        );
    }

    #[tokio::test]
    async fn missing_checksum_list_is_reported() {
        let temp = tempfile::tempdir().expect("Should create temp dir");
        let index = seeded_index(temp.path(), false);
        let resolver = VersionSpecResolver::new(&index, TARGET);

        let err = resolver
            .resolve_release(&spec("lts"))
            .await
            .expect_err("Should fail without checksums");
        assert!(matches!(err, ToolchainError::IndexUnavailable { .. }));
    }

    #[tokio::test]
    async fn lts_only_applies_to_ranges() {
        let temp = tempfile::tempdir().expect("Should create temp dir");
        let index = seeded_index(temp.path(), true);
        let resolver = VersionSpecResolver::new(&index, TARGET).lts_only(true);

        let descriptor = resolver
            .resolve_release(&spec("*"))
            .await
            .expect("Should resolve");
        assert_eq!(descriptor.version, Version::new(20, 9, 0));
    }

    #[tokio::test]
    async fn missing_system_node_falls_back_to_index() {
        let temp = tempfile::tempdir().expect("Should create temp dir");
        let index = seeded_index(temp.path(), true);
        let resolver = VersionSpecResolver::new(&index, TARGET)
            .node_executable(Some(temp.path().join("no-such-node")));

        let resolution = resolver
            .resolve(&spec("18.17.0"), true)
            .await
            .expect("Should resolve");
        match resolution {
            Resolution::Release(descriptor) => {
                assert_eq!(descriptor.version, Version::new(18, 17, 0));
            }
            Resolution::System(system) => panic!("Expected a release, got {system:?}"),
        }
    }
}
