#![cfg(unix)]
//! End-to-end acquisition against a local release server.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use httpmock::prelude::*;
use nodekit_toolchain::index::IndexSnapshot;
use nodekit_toolchain::{
    CacheKey, CacheLayout, CacheState, HostTarget, Toolchain, ToolchainError, ToolchainOptions,
    ToolchainSource, VersionSpec,
};
use semver::Version;
use sha2::{Digest, Sha256};

const VERSION: &str = "18.17.0";

fn target() -> HostTarget {
    HostTarget::detect().expect("Should run on a supported host")
}

fn index_json() -> String {
    format!(
        r#"[
            {{"version": "v20.9.0", "date": "2023-10-24", "files": ["src"], "lts": "Iron"}},
            {{"version": "v{VERSION}", "date": "2023-07-18", "files": ["{}"], "lts": "Hydrogen"}}
        ]"#,
        target().index_file_id()
    )
}

fn archive_name() -> String {
    target().archive_name(&Version::parse(VERSION).expect("Should parse version"))
}

fn archive_path() -> String {
    format!("/dist/v{VERSION}/{}", archive_name())
}

/// A tarball shaped like an upstream release: one top-level directory holding
/// `bin/node`, `bin/npm` and `bin/npx`.
fn fake_tarball() -> Vec<u8> {
    let top = archive_name().trim_end_matches(".tar.gz").to_string();
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (tool, body) in [
        ("node", format!("#!/bin/sh\necho v{VERSION}\n")),
        ("npm", "#!/bin/sh\necho 9.6.7\n".to_string()),
        ("npx", "#!/bin/sh\necho 9.6.7\n".to_string()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{top}/bin/{tool}"), body.as_bytes())
            .expect("Should append entry");
    }

    builder
        .into_inner()
        .expect("Should finish tar")
        .finish()
        .expect("Should finish gzip")
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn shasums(archive: &[u8]) -> String {
    format!(
        "{}  {}\n{}  node-v{VERSION}.tar.gz\n",
        sha256_hex(archive),
        archive_name(),
        sha256_hex(b"source")
    )
}

fn options(server: &MockServer, root: &Path) -> ToolchainOptions {
    ToolchainOptions {
        cache_dir: Some(root.to_path_buf()),
        allow_system: false,
        mirror: server.url("/dist"),
        download_retry_base_ms: 1,
        ..ToolchainOptions::default()
    }
}

fn spec(s: &str) -> VersionSpec {
    VersionSpec::parse(s).expect("Should parse spec")
}

struct Release<'a> {
    index: httpmock::Mock<'a>,
    shasums: httpmock::Mock<'a>,
    archive: httpmock::Mock<'a>,
}

/// Serves the index and checksum list of the test release.
async fn serve_metadata<'a>(
    server: &'a MockServer,
    published: &str,
) -> (httpmock::Mock<'a>, httpmock::Mock<'a>) {
    let index = server
        .mock_async(|when, then| {
            when.method(GET).path("/dist/index.json");
            then.status(200).body(index_json());
        })
        .await;
    let shasums = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/dist/v{VERSION}/SHASUMS256.txt"));
            then.status(200).body(published);
        })
        .await;
    (index, shasums)
}

async fn serve_archive<'a>(server: &'a MockServer, status: u16, body: &[u8]) -> httpmock::Mock<'a> {
    server
        .mock_async(|when, then| {
            when.method(GET).path(archive_path());
            then.status(status).body(body);
        })
        .await
}

async fn serve_release<'a>(server: &'a MockServer, archive: &[u8], published: &str) -> Release<'a> {
    let (index, shasums) = serve_metadata(server, published).await;
    let archive = serve_archive(server, 200, archive).await;
    Release {
        index,
        shasums,
        archive,
    }
}

fn toolchain_dirs(root: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(root.join("toolchains")) {
        Ok(read) => read.flatten().map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[tokio::test]
async fn second_acquire_reuses_the_cache() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let release = serve_release(&server, &archive, &shasums(&archive)).await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let first = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect("Should install");
    let second = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect("Should reuse");

    assert_eq!(first, second);
    assert_eq!(first.source, ToolchainSource::Cache);
    assert_eq!(first.version, Version::new(18, 17, 0));
    assert!(first.node.ends_with("bin/node"));
    assert!(first.npx.is_file());
    release.archive.assert_hits_async(1).await;
    release.index.assert_hits_async(1).await;

    let mode = std::fs::metadata(&first.node)
        .expect("Should stat node")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_share_one_download() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let release = serve_release(&server, &archive, &shasums(&archive)).await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let requested = spec("^18");
    let handles = futures_util::future::join_all(
        (0..6).map(|_| toolchain.acquire(&requested, false)),
    )
    .await;

    let roots: Vec<PathBuf> = handles
        .into_iter()
        .map(|h| h.expect("Should acquire").root)
        .collect();
    assert!(roots.windows(2).all(|w| w[0] == w[1]));
    release.archive.assert_hits_async(1).await;

    let entries = toolchain.list().expect("Should list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, CacheState::Ready);
}

#[tokio::test]
async fn corrupted_archive_leaves_no_entry() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let published = shasums(&archive);
    let mut corrupted = archive.clone();
    let middle = corrupted.len() / 2;
    corrupted[middle] ^= 0xff;
    let release = serve_release(&server, &corrupted, &published).await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let err = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect_err("Should reject corrupted archive");

    match err {
        ToolchainError::IntegrityError {
            expected, actual, ..
        } => {
            assert_eq!(expected, sha256_hex(&archive));
            assert_eq!(actual, sha256_hex(&corrupted));
        }
        other => panic!("Expected IntegrityError, got {other:?}"),
    }
    release.archive.assert_hits_async(1).await;
    assert!(toolchain_dirs(temp.path()).is_empty());
    assert!(toolchain.list().expect("Should list").is_empty());
}

#[tokio::test]
async fn orphaned_staging_is_ignored_then_swept() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let release = serve_release(&server, &archive, &shasums(&archive)).await;

    let key = CacheKey::for_target(Version::new(18, 17, 0), target());
    let layout = CacheLayout::new(temp.path().to_path_buf());
    let orphan = layout.staging_dir(&key.dir_name(), "0badc0ffee00");
    std::fs::create_dir_all(orphan.join("bin")).expect("Should create orphan");
    for tool in ["node", "npm", "npx"] {
        std::fs::write(orphan.join("bin").join(tool), "").expect("Should write orphan tool");
    }

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    assert_eq!(toolchain.store().lookup(&key), None);
    let listed = toolchain.list().expect("Should list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, CacheState::Installing);

    let handle = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect("Should install over orphan");

    assert!(!orphan.exists());
    assert_eq!(handle.root, layout.entry_dir(&key.dir_name()));
    assert_eq!(toolchain_dirs(temp.path()), vec![handle.root.clone()]);
    release.archive.assert_hits_async(1).await;
}

#[tokio::test]
async fn satisfying_system_node_skips_the_network() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let release = serve_release(&server, &archive, &shasums(&archive)).await;

    let bin = temp.path().join("system-bin");
    std::fs::create_dir_all(&bin).expect("Should create bin");
    for (tool, body) in [
        ("node", "#!/bin/sh\necho v18.19.1\n"),
        ("npm", "#!/bin/sh\n"),
        ("npx", "#!/bin/sh\n"),
    ] {
        let path = bin.join(tool);
        std::fs::write(&path, body).expect("Should write tool");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Should chmod tool");
    }

    let mut options = options(&server, &temp.path().join("cache"));
    options.node_executable = Some(bin.join("node"));
    let toolchain = Toolchain::new(options).expect("Should create toolchain");

    let handle = toolchain
        .acquire(&spec("^18"), true)
        .await
        .expect("Should use system node");

    assert_eq!(handle.source, ToolchainSource::System);
    assert_eq!(handle.version, Version::new(18, 19, 1));
    assert_eq!(handle.node, bin.join("node"));
    assert_eq!(handle.root, bin);
    release.index.assert_hits_async(0).await;
    release.shasums.assert_hits_async(0).await;
    release.archive.assert_hits_async(0).await;
}

#[tokio::test]
async fn stale_index_survives_failed_refresh() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let published = shasums(&archive);

    let index = server
        .mock_async(|when, then| {
            when.method(GET).path("/dist/index.json");
            then.status(500);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/dist/v{VERSION}/SHASUMS256.txt"));
            then.status(200).body(&published);
        })
        .await;
    serve_archive(&server, 200, &archive).await;

    let layout = CacheLayout::new(temp.path().to_path_buf());
    layout.ensure().expect("Should create layout");
    let stale = IndexSnapshot {
        fetched_at: 0,
        entries: IndexSnapshot::parse_manifest(&index_json()).expect("Should parse index"),
    };
    std::fs::write(
        layout.index_file(),
        serde_json::to_vec(&stale).expect("Should encode snapshot"),
    )
    .expect("Should write snapshot");

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let handle = toolchain
        .acquire(&spec("lts/hydrogen"), false)
        .await
        .expect("Should resolve from stale index");

    assert_eq!(handle.version, Version::new(18, 17, 0));
    index.assert_hits_async(1).await;
}

#[tokio::test]
async fn missing_index_without_snapshot_is_unavailable() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    server
        .mock_async(|when, then| {
            when.method(GET).path("/dist/index.json");
            then.status(503);
        })
        .await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let err = toolchain
        .acquire(&spec("lts"), false)
        .await
        .expect_err("Should fail without any index");
    assert!(matches!(err, ToolchainError::IndexUnavailable { .. }));
}

#[tokio::test]
async fn server_errors_are_retried_up_to_the_cap() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let _metadata = serve_metadata(&server, &shasums(&archive)).await;
    let failing = serve_archive(&server, 503, b"unavailable").await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let err = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect_err("Should give up");

    match err {
        ToolchainError::DownloadFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("Expected DownloadFailed, got {other:?}"),
    }
    failing.assert_hits_async(3).await;
    assert!(toolchain_dirs(temp.path()).is_empty());
}

#[tokio::test]
async fn not_found_is_not_retried() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let _metadata = serve_metadata(&server, &shasums(&archive)).await;
    let missing = serve_archive(&server, 404, b"not found").await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let err = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect_err("Should fail");

    match err {
        ToolchainError::DownloadFailed { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("Expected DownloadFailed, got {other:?}"),
    }
    missing.assert_hits_async(1).await;
}

#[tokio::test]
async fn invalidate_then_reacquire_downloads_again() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let release = serve_release(&server, &archive, &shasums(&archive)).await;

    let toolchain = Toolchain::new(options(&server, temp.path())).expect("Should create toolchain");
    let version = Version::new(18, 17, 0);
    let handle = toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect("Should install");

    assert!(toolchain.invalidate(&version).await.expect("Should invalidate"));
    assert!(!handle.root.exists());
    assert!(!toolchain.invalidate(&version).await.expect("Should invalidate"));

    toolchain
        .acquire(&spec(VERSION), false)
        .await
        .expect("Should reinstall");
    release.archive.assert_hits_async(2).await;
}

#[tokio::test]
async fn cached_toolchain_satisfies_range_while_offline() {
    let server = MockServer::start_async().await;
    let temp = tempfile::tempdir().expect("Should create temp dir");
    let archive = fake_tarball();
    let _release = serve_release(&server, &archive, &shasums(&archive)).await;

    let installed = Toolchain::new(options(&server, temp.path()))
        .expect("Should create toolchain")
        .acquire(&spec(VERSION), false)
        .await
        .expect("Should install");

    let layout = CacheLayout::new(temp.path().to_path_buf());
    std::fs::remove_file(layout.index_file()).expect("Should remove index snapshot");
    let offline = ToolchainOptions {
        mirror: "http://127.0.0.1:9/dist".to_string(),
        ..options(&server, temp.path())
    };

    let handle = Toolchain::new(offline)
        .expect("Should create toolchain")
        .acquire(&spec(">=18"), false)
        .await
        .expect("Should use the cached toolchain");
    assert_eq!(handle, installed);

    let err = Toolchain::new(options(&server, temp.path()))
        .expect("Should create toolchain")
        .acquire(&spec(">=19"), false)
        .await
        .expect_err("Should not settle for a non-matching cached version");
    assert!(matches!(err, ToolchainError::UnresolvableVersion { .. }), "{err:?}");
}
