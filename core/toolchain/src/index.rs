//! The upstream Node.js release index.
//!
//! The index is the `index.json` file published at the root of the
//! distribution server (default `https://nodejs.org/dist`). Each release lists
//! its version, LTS codename (or `false`), and the build identifiers it ships:
//!
//! ```json
//! [
//!   {
//!     "version": "v18.17.0",
//!     "date": "2023-07-18",
//!     "files": ["linux-x64", "osx-arm64-tar", "win-x64-zip"],
//!     "lts": "Hydrogen"
//!   }
//! ]
//! ```
//!
//! Checksums are not part of the index. Each release directory carries a
//! `SHASUMS256.txt`, which is fetched once per release and kept on disk since
//! published releases never change.
//!
//! ## Caching
//!
//! The parsed index is persisted as an [`IndexSnapshot`] with its fetch time.
//! A snapshot younger than the TTL is used as is. An older one triggers a
//! refresh, but if the refresh fails the stale snapshot is still served: a
//! flaky network should not break a build that resolved fine an hour ago.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::download::http_client;
use crate::errors::{ToolchainError, ToolchainResult};
use crate::paths::CacheLayout;
use crate::platform::HostTarget;
use crate::version_spec::VersionSpec;

/// Default distribution server.
pub const DEFAULT_MIRROR: &str = "https://nodejs.org/dist";

/// Name of the per-release checksum list.
const SHASUMS_FILE: &str = "SHASUMS256.txt";

/// Request timeout for index and checksum fetches, in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// One published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// Release version.
    pub version: Version,
    /// LTS codename, if the release belongs to an LTS line.
    pub lts: Option<String>,
    /// Release date as published (`YYYY-MM-DD`).
    pub date: Option<String>,
    /// Build identifiers, e.g. `linux-x64` or `win-x64-zip`.
    pub files: Vec<String>,
}

impl ReleaseEntry {
    /// Whether the release ships a build for `target`.
    #[must_use]
    pub fn has_build_for(&self, target: HostTarget) -> bool {
        let id = target.index_file_id();
        self.files.iter().any(|f| *f == id)
    }
}

/// A parsed index together with the time it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Unix timestamp (seconds) of the fetch.
    pub fetched_at: u64,
    /// Releases in upstream order (newest first).
    pub entries: Vec<ReleaseEntry>,
}

/// Wire format of one index entry.
#[derive(Deserialize)]
struct RawRelease {
    version: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    lts: RawLts,
}

/// `lts` is `false` for non-LTS releases and the codename otherwise.
#[derive(Deserialize, Default)]
#[serde(untagged)]
enum RawLts {
    #[default]
    None,
    Flag(bool),
    Codename(String),
}

impl IndexSnapshot {
    /// Creates a snapshot stamped with the current time.
    #[must_use]
    pub fn new(entries: Vec<ReleaseEntry>) -> Self {
        Self {
            fetched_at: current_timestamp(),
            entries,
        }
    }

    /// Parses an upstream `index.json` body.
    ///
    /// Entries that do not have the expected shape or an unparsable version
    /// are skipped; only a body that is not a JSON array is an error.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if `body` is not an array.
    pub fn parse_manifest(body: &str) -> Result<Vec<ReleaseEntry>, serde_json::Error> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(body)?;
        let mut entries = Vec::with_capacity(raw.len());

        for value in raw {
            let release = match serde_json::from_value::<RawRelease>(value) {
                Ok(release) => release,
                Err(e) => {
                    debug!(error = %e, "skipping malformed index entry");
                    continue;
                }
            };
            let text = release.version.trim();
            let Ok(version) = Version::parse(text.strip_prefix('v').unwrap_or(text)) else {
                debug!(version = %release.version, "skipping index entry with invalid version");
                continue;
            };
            let lts = match release.lts {
                RawLts::Codename(name) if !name.is_empty() => Some(name),
                RawLts::Codename(_) | RawLts::Flag(_) | RawLts::None => None,
            };
            entries.push(ReleaseEntry {
                version,
                lts,
                date: release.date,
                files: release.files,
            });
        }

        Ok(entries)
    }

    /// Seconds since the snapshot was fetched.
    #[must_use]
    pub fn age(&self) -> Duration {
        Duration::from_secs(current_timestamp().saturating_sub(self.fetched_at))
    }

    /// Whether the snapshot is younger than `ttl`.
    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    /// Selects the highest release satisfying `spec` that ships a build for
    /// `target`.
    ///
    /// With `lts_only`, open-ended specs (`*` and ranges) only consider LTS
    /// releases; exact versions and tags are unaffected.
    #[must_use]
    pub fn best_match(
        &self,
        spec: &VersionSpec,
        target: HostTarget,
        lts_only: bool,
    ) -> Option<&ReleaseEntry> {
        let restrict_to_lts = lts_only && matches!(spec, VersionSpec::Any | VersionSpec::Range(_));
        self.entries
            .iter()
            .filter(|e| e.has_build_for(target))
            .filter(|e| !restrict_to_lts || e.lts.is_some())
            .filter(|e| spec.matches(&e.version, e.lts.as_deref()))
            .max_by(|a, b| a.version.cmp(&b.version))
    }
}

/// Fetches and caches the release index and per-release checksums.
pub struct ReleaseIndex {
    client: reqwest::Client,
    mirror: String,
    index_file: PathBuf,
    shasums_dir: PathBuf,
    ttl: Duration,
    current: Mutex<Option<Arc<IndexSnapshot>>>,
}

impl ReleaseIndex {
    /// Creates an index reader for `mirror`, persisting under `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(layout: &CacheLayout, mirror: &str, ttl: Duration) -> ToolchainResult<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(REQUEST_TIMEOUT_SECS))?,
            mirror: normalize_mirror(mirror),
            index_file: layout.index_file(),
            shasums_dir: layout.shasums_dir(),
            ttl,
            current: Mutex::new(None),
        })
    }

    /// The distribution server this index reads from.
    #[must_use]
    pub fn mirror(&self) -> &str {
        &self.mirror
    }

    /// URL of the index manifest.
    #[must_use]
    pub fn index_url(&self) -> String {
        format!("{}/index.json", self.mirror)
    }

    /// URL of a file inside a release directory.
    #[must_use]
    pub fn release_url(&self, version: &Version, file: &str) -> String {
        format!("{}/v{version}/{file}", self.mirror)
    }

    /// Returns the current snapshot, refreshing it when stale or forced.
    ///
    /// A failed refresh falls back to the previous snapshot (logged at warn
    /// level).
    ///
    /// # Errors
    ///
    /// Returns `IndexUnavailable` if the refresh fails and no snapshot exists,
    /// neither in memory nor on disk.
    pub async fn snapshot(&self, force_refresh: bool) -> ToolchainResult<Arc<IndexSnapshot>> {
        let mut current = self.current.lock().await;

        if current.is_none() {
            *current = load_persisted(&self.index_file).map(Arc::new);
        }

        if let Some(snapshot) = current.as_ref()
            && !force_refresh
            && snapshot.is_fresh(self.ttl)
        {
            debug!(age_secs = snapshot.age().as_secs(), "using cached release index");
            return Ok(Arc::clone(snapshot));
        }

        let url = self.index_url();
        match self.fetch_manifest(&url).await {
            Ok(entries) => {
                info!(url = %url, releases = entries.len(), "fetched release index");
                let snapshot = Arc::new(IndexSnapshot::new(entries));
                if let Err(e) = persist_json(&self.index_file, snapshot.as_ref()) {
                    warn!(error = %e, "failed to persist release index");
                }
                *current = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(reason) => match current.as_ref() {
                Some(stale) => {
                    warn!(
                        url = %url,
                        age_secs = stale.age().as_secs(),
                        reason = %reason,
                        "release index refresh failed, using stale snapshot"
                    );
                    Ok(Arc::clone(stale))
                }
                None => Err(ToolchainError::index_unavailable(url, reason)),
            },
        }
    }

    /// Returns the published SHA-256 of `file` in release `version`.
    ///
    /// # Errors
    ///
    /// Returns `IndexUnavailable` if the checksum list cannot be fetched and
    /// `ChecksumMissing` if it does not list `file`.
    pub async fn checksum(&self, version: &Version, file: &str) -> ToolchainResult<String> {
        let url = self.release_url(version, SHASUMS_FILE);
        let cached = self.shasums_dir.join(format!("v{version}.txt"));

        let body = match std::fs::read_to_string(&cached) {
            Ok(body) => body,
            Err(_) => {
                let body = self
                    .fetch_text(&url)
                    .await
                    .map_err(|reason| ToolchainError::index_unavailable(&url, reason))?;
                if let Err(e) = persist_text(&cached, &body) {
                    warn!(error = %e, path = %cached.display(), "failed to cache checksum list");
                }
                body
            }
        };

        find_checksum(&body, file).ok_or_else(|| ToolchainError::ChecksumMissing {
            file: file.to_string(),
            url,
        })
    }

    async fn fetch_manifest(&self, url: &str) -> Result<Vec<ReleaseEntry>, String> {
        let body = self.fetch_text(url).await?;
        IndexSnapshot::parse_manifest(&body).map_err(|e| format!("invalid index: {e}"))
    }

    async fn fetch_text(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                404 => "not found (404)".to_string(),
                code if code >= 500 => format!("server error ({code})"),
                code => format!("HTTP error {code}"),
            });
        }

        response
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))
    }
}

/// Finds `file` in a `SHASUMS256.txt` body (`<hex>  <name>` per line).
fn find_checksum(body: &str, file: &str) -> Option<String> {
    body.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts.next()?;
        let name = name.strip_prefix('*').unwrap_or(name);
        (name == file).then(|| hash.to_ascii_lowercase())
    })
}

/// Trims whitespace and trailing slashes from a mirror URL.
#[must_use]
pub fn normalize_mirror(mirror: &str) -> String {
    mirror.trim().trim_end_matches('/').to_string()
}

/// Loads a persisted snapshot; unreadable files are removed.
fn load_persisted(path: &Path) -> Option<IndexSnapshot> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<IndexSnapshot>(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            debug!(error = %e, path = %path.display(), "discarding unreadable index snapshot");
            let _ = std::fs::remove_file(path);
            None
        }
    }
}

fn persist_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let content = serde_json::to_string(value).map_err(std::io::Error::other)?;
    persist_text(path, &content)
}

/// Writes `content` to `path` via a sibling temp file and rename.
fn persist_text(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Returns the current Unix timestamp.
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Arch, Platform};

    const LINUX: HostTarget = HostTarget::new(Platform::Linux, Arch::X64);
    const WINDOWS: HostTarget = HostTarget::new(Platform::Windows, Arch::X64);

    const MANIFEST: &str = r#"[
        {"version": "v21.1.0", "date": "2023-10-24", "files": ["linux-x64", "win-x64-zip"], "lts": false},
        {"version": "v20.9.0", "date": "2023-10-24", "files": ["linux-x64", "win-x64-zip"], "lts": "Iron"},
        {"version": "v20.8.0", "date": "2023-09-28", "files": ["linux-x64"], "lts": false},
        {"version": "v18.18.2", "date": "2023-10-13", "files": ["linux-x64"], "lts": "Hydrogen"},
        {"version": "v18.17.0", "date": "2023-07-18", "files": ["linux-x64", "win-x64-zip"], "lts": "Hydrogen"},
        {"version": "v16.20.2", "date": "2023-08-08", "files": ["linux-x64", "win-x64-zip"], "lts": "Gallium"}
    ]"#;

    fn snapshot() -> IndexSnapshot {
        IndexSnapshot::new(IndexSnapshot::parse_manifest(MANIFEST).expect("Should parse"))
    }

    fn resolve(spec: &str, target: HostTarget) -> Option<String> {
        let spec = VersionSpec::parse(spec).expect("Should parse spec");
        snapshot()
            .best_match(&spec, target, false)
            .map(|e| e.version.to_string())
    }

    #[test]
    fn parse_manifest_reads_versions_and_lts() {
        let entries = IndexSnapshot::parse_manifest(MANIFEST).expect("Should parse");
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[0].version, Version::new(21, 1, 0));
        assert_eq!(entries[0].lts, None);
        assert_eq!(entries[1].lts.as_deref(), Some("Iron"));
    }

    #[test]
    fn parse_manifest_skips_malformed_entries() {
        let body = r#"[
            {"version": "v20.9.0", "files": ["linux-x64"], "lts": "Iron"},
            {"version": "not-a-version", "files": ["linux-x64"]},
            {"files": ["linux-x64"]},
            {"version": "v18.17.0", "files": "linux-x64"},
            42,
            {"version": "v16.20.2", "files": ["linux-x64"], "lts": false}
        ]"#;
        let entries = IndexSnapshot::parse_manifest(body).expect("Should parse");
        let versions: Vec<String> = entries.iter().map(|e| e.version.to_string()).collect();
        assert_eq!(versions, ["20.9.0", "16.20.2"]);
    }

    #[test]
    fn parse_manifest_rejects_non_array() {
        assert!(IndexSnapshot::parse_manifest(r#"{"version": "v1.0.0"}"#).is_err());
    }

    #[test]
    fn resolution_winners_are_deterministic() {
        assert_eq!(resolve("18.17.0", LINUX).as_deref(), Some("18.17.0"));
        assert_eq!(resolve("^18", LINUX).as_deref(), Some("18.18.2"));
        assert_eq!(resolve("lts", LINUX).as_deref(), Some("20.9.0"));
        assert_eq!(resolve("lts/hydrogen", LINUX).as_deref(), Some("18.18.2"));
        assert_eq!(resolve("latest", LINUX).as_deref(), Some("21.1.0"));
        assert_eq!(resolve(">=16 <20", LINUX).as_deref(), Some("18.18.2"));
        assert_eq!(resolve("^22", LINUX), None);
    }

    #[test]
    fn resolution_skips_releases_without_host_build() {
        assert_eq!(resolve("^18", WINDOWS).as_deref(), Some("18.17.0"));
        assert_eq!(resolve("~20.8", WINDOWS), None);
    }

    #[test]
    fn lts_only_restricts_open_ranges() {
        let snap = snapshot();
        let any = VersionSpec::parse("*").expect("Should parse spec");
        let range = VersionSpec::parse(">=20").expect("Should parse spec");
        let exact = VersionSpec::parse("20.8.0").expect("Should parse spec");

        let pick = |spec: &VersionSpec| {
            snap.best_match(spec, LINUX, true)
                .map(|e| e.version.to_string())
        };
        assert_eq!(pick(&any).as_deref(), Some("20.9.0"));
        assert_eq!(pick(&range).as_deref(), Some("20.9.0"));
        assert_eq!(pick(&exact).as_deref(), Some("20.8.0"));
    }

    #[test]
    fn find_checksum_reads_shasums_lines() {
        let body = "\
abc123  node-v18.17.0-darwin-arm64.tar.gz
DEF456  node-v18.17.0-linux-x64.tar.gz
0000ff *node-v18.17.0-win-x64.zip
";
        assert_eq!(
            find_checksum(body, "node-v18.17.0-linux-x64.tar.gz").as_deref(),
            Some("def456")
        );
        assert_eq!(
            find_checksum(body, "node-v18.17.0-win-x64.zip").as_deref(),
            Some("0000ff")
        );
        assert_eq!(find_checksum(body, "node-v18.17.0-linux-arm64.tar.gz"), None);
    }

    #[test]
    fn normalize_mirror_trims_trailing_slash() {
        assert_eq!(
            normalize_mirror("  https://nodejs.org/dist/ "),
            "https://nodejs.org/dist"
        );
    }

    #[test]
    fn snapshot_freshness_follows_ttl() {
        let mut snap = snapshot();
        assert!(snap.is_fresh(Duration::from_secs(60)));
        snap.fetched_at = current_timestamp() - 120;
        assert!(!snap.is_fresh(Duration::from_secs(60)));
        assert!(snap.age() >= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn stale_persisted_snapshot_survives_failed_refresh() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let layout = CacheLayout::new(dir.path().to_path_buf());

        let mut stale = snapshot();
        stale.fetched_at = current_timestamp() - 10_000;
        persist_json(&layout.index_file(), &stale).expect("Should persist snapshot");

        // Nothing listens on the discard port, so the refresh fails fast.
        let index = ReleaseIndex::new(&layout, "http://127.0.0.1:9", Duration::from_secs(60))
            .expect("Should create index");
        let snap = index.snapshot(false).await.expect("Should fall back to stale");
        assert_eq!(snap.entries.len(), 6);
        assert_eq!(snap.fetched_at, stale.fetched_at);
    }

    #[tokio::test]
    async fn missing_snapshot_and_failed_refresh_is_index_unavailable() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let layout = CacheLayout::new(dir.path().to_path_buf());

        let index = ReleaseIndex::new(&layout, "http://127.0.0.1:9/", Duration::from_secs(60))
            .expect("Should create index");
        let err = index.snapshot(false).await.expect_err("Should fail");
        assert!(matches!(
            err,
            ToolchainError::IndexUnavailable { ref url, .. }
                if url == "http://127.0.0.1:9/index.json"
        ));
    }

    #[tokio::test]
    async fn corrupt_persisted_snapshot_is_discarded() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let layout = CacheLayout::new(dir.path().to_path_buf());
        persist_text(&layout.index_file(), "{not json").expect("Should write");

        let index = ReleaseIndex::new(&layout, "http://127.0.0.1:9", Duration::from_secs(60))
            .expect("Should create index");
        assert!(index.snapshot(false).await.is_err());
        assert!(!layout.index_file().exists());
    }

    #[tokio::test]
    async fn cached_checksum_list_avoids_network() {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let layout = CacheLayout::new(dir.path().to_path_buf());
        persist_text(
            &layout.shasums_dir().join("v18.17.0.txt"),
            "aa11  node-v18.17.0-linux-x64.tar.gz\n",
        )
        .expect("Should write");

        let index = ReleaseIndex::new(&layout, "http://127.0.0.1:9", Duration::from_secs(60))
            .expect("Should create index");
        let version = Version::new(18, 17, 0);
        let sum = index
            .checksum(&version, "node-v18.17.0-linux-x64.tar.gz")
            .await
            .expect("Should read cached checksum");
        assert_eq!(sum, "aa11");

        let missing = index
            .checksum(&version, "node-v18.17.0-linux-arm64.tar.gz")
            .await
            .expect_err("Should be missing");
        assert!(matches!(missing, ToolchainError::ChecksumMissing { .. }));
    }
}
