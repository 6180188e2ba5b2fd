//! Archive downloads with integrity verification.
//!
//! Archives are streamed into a uniquely named `.part` file in the cache's
//! scratch directory while their SHA-256 is computed. Only an archive whose
//! digest matches the published checksum is handed out, as a
//! [`VerifiedArchive`] that deletes its file when dropped.
//!
//! ## Retries
//!
//! Connection failures, timeouts, interrupted bodies and HTTP 5xx/408/429 are
//! retried with exponential backoff (base delay doubled per retry, ±25%
//! jitter). Any other HTTP status and checksum mismatches fail immediately.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::{ToolchainError, ToolchainResult};
use crate::resolver::ReleaseDescriptor;

/// User agent sent with every request.
pub(crate) const USER_AGENT: &str = concat!("nodekit/", env!("CARGO_PKG_VERSION"));

/// Retry and timeout settings for archive downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per archive, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Timeout of each attempt.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), with ±25% jitter.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let base = base_ms.saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)));
        let jitter_range = base / 4;
        let jitter = rand::rng().random_range(0..=jitter_range * 2);
        Duration::from_millis(base - jitter_range + jitter)
    }
}

/// A downloaded archive whose checksum matched.
///
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct VerifiedArchive {
    path: TempPath,
    url: String,
    sha256: String,
    size: u64,
}

impl VerifiedArchive {
    /// Location of the archive in the scratch directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// URL the archive was fetched from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Lowercase hex SHA-256 of the archive.
    #[must_use]
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Archive size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Why a single attempt failed.
enum AttemptError {
    /// Worth retrying.
    Transient(String),
    /// Retrying cannot help.
    Permanent(String),
    /// Local failure (scratch file), surfaced as is.
    Local(ToolchainError),
}

/// Bytes received by one successful attempt.
struct Fetched {
    path: TempPath,
    sha256: String,
    size: u64,
}

/// Fetches release archives into a scratch directory.
pub struct Downloader {
    client: reqwest::Client,
    scratch_dir: PathBuf,
    policy: RetryPolicy,
}

impl Downloader {
    /// Creates a downloader writing into `scratch_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(scratch_dir: PathBuf, policy: RetryPolicy) -> ToolchainResult<Self> {
        Ok(Self {
            client: http_client(policy.request_timeout)?,
            scratch_dir,
            policy,
        })
    }

    /// Downloads and verifies the archive described by `descriptor`.
    ///
    /// # Errors
    ///
    /// - `DownloadFailed` on a permanent HTTP failure or once retries are
    ///   exhausted
    /// - `IntegrityError` if the received bytes do not match the checksum
    /// - `Io` if the scratch file cannot be written
    pub async fn fetch(&self, descriptor: &ReleaseDescriptor) -> ToolchainResult<VerifiedArchive> {
        let url = descriptor.archive_url.as_str();

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| {
                ToolchainError::io(
                    format!("creating scratch directory {}", self.scratch_dir.display()),
                    e,
                )
            })?;

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.policy.delay_for(attempt - 1);
                warn!(
                    url = %url,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %last_reason,
                    "retrying download"
                );
                tokio::time::sleep(delay).await;
            }

            info!(url = %url, attempt, "downloading archive");
            match self.attempt(url).await {
                Ok(fetched) => {
                    if !fetched.sha256.eq_ignore_ascii_case(&descriptor.checksum) {
                        return Err(ToolchainError::IntegrityError {
                            url: url.to_string(),
                            expected: descriptor.checksum.to_ascii_lowercase(),
                            actual: fetched.sha256,
                        });
                    }
                    debug!(url = %url, size = fetched.size, "archive verified");
                    return Ok(VerifiedArchive {
                        path: fetched.path,
                        url: url.to_string(),
                        sha256: fetched.sha256,
                        size: fetched.size,
                    });
                }
                Err(AttemptError::Transient(reason)) => last_reason = reason,
                Err(AttemptError::Permanent(reason)) => {
                    return Err(ToolchainError::DownloadFailed {
                        url: url.to_string(),
                        attempts: attempt,
                        reason,
                    });
                }
                Err(AttemptError::Local(e)) => return Err(e),
            }
        }

        Err(ToolchainError::DownloadFailed {
            url: url.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    async fn attempt(&self, url: &str) -> Result<Fetched, AttemptError> {
        let part = tempfile::Builder::new()
            .prefix("node-")
            .suffix(".part")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| {
                AttemptError::Local(ToolchainError::io(
                    format!("creating scratch file in {}", self.scratch_dir.display()),
                    e,
                ))
            })?;
        let (file, path) = part.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {status}");
            return Err(if is_transient_status(status.as_u16()) {
                AttemptError::Transient(reason)
            } else {
                AttemptError::Permanent(reason)
            });
        }

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AttemptError::Transient(format!("interrupted body: {e}")))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(|e| {
                AttemptError::Local(ToolchainError::io(
                    format!("writing {}", path.display()),
                    e,
                ))
            })?;
            size += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| {
            AttemptError::Local(ToolchainError::io(format!("flushing {}", path.display()), e))
        })?;
        drop(file);

        Ok(Fetched {
            path,
            sha256: hex::encode(hasher.finalize()),
            size,
        })
    }
}

/// Whether an HTTP status is worth retrying.
#[must_use]
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

fn classify_request_error(e: &reqwest::Error) -> AttemptError {
    if e.is_builder() {
        AttemptError::Permanent(format!("invalid request: {e}"))
    } else if e.is_timeout() {
        AttemptError::Transient(format!("timed out: {e}"))
    } else if e.is_connect() {
        AttemptError::Transient(format!("connection failed: {e}"))
    } else {
        AttemptError::Transient(format!("request failed: {e}"))
    }
}

/// Builds the HTTP client shared by index and archive fetches.
pub(crate) fn http_client(timeout: Duration) -> ToolchainResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ToolchainError::io("creating HTTP client", std::io::Error::other(e)))
}
