//! Error types for Node.js toolchain acquisition.
//!
//! Every fallible operation in this crate returns [`ToolchainResult`]. The
//! variants follow the acquisition pipeline: resolving a spec, reading the
//! release index, downloading and verifying an archive, extracting it, and
//! coordinating the cache lock. Messages always name the offending spec, URL,
//! or path so a failing build reports something actionable.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for toolchain operations.
pub type ToolchainResult<T> = Result<T, ToolchainError>;

/// All errors that can occur while acquiring a toolchain.
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// The requirement string could not be parsed.
    #[error("invalid version spec '{spec}': {reason}")]
    InvalidVersionSpec {
        /// The spec as given by the caller.
        spec: String,
        /// Why parsing failed.
        reason: String,
    },

    /// The release index could not be fetched and no snapshot is cached.
    #[error("release index unavailable at {url}: {reason}")]
    IndexUnavailable {
        /// The index or checksum list URL.
        url: String,
        /// The underlying failure.
        reason: String,
    },

    /// No release or system installation satisfies the spec.
    #[error("no Node.js release satisfies '{spec}' for {target}")]
    UnresolvableVersion {
        /// The spec as given by the caller.
        spec: String,
        /// Host platform and architecture, e.g. `linux-x64`.
        target: String,
    },

    /// The release's checksum list does not mention the archive.
    #[error("no checksum for {file} in {url}")]
    ChecksumMissing {
        /// Archive file name.
        file: String,
        /// URL of the checksum list.
        url: String,
    },

    /// The running host has no upstream Node.js build.
    #[error("unsupported platform: {os} on {arch}")]
    UnsupportedPlatform {
        /// `std::env::consts::OS`.
        os: String,
        /// `std::env::consts::ARCH`.
        arch: String,
    },

    /// A download failed permanently or exhausted its retries.
    #[error("download of {url} failed after {attempts} attempt(s): {reason}")]
    DownloadFailed {
        /// The archive URL.
        url: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// The downloaded archive does not match its published checksum.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    IntegrityError {
        /// The archive URL.
        url: String,
        /// Published checksum.
        expected: String,
        /// Checksum of the received bytes.
        actual: String,
    },

    /// The archive is truncated, corrupt, or contains unsafe paths.
    #[error("failed to extract {archive}: {reason}")]
    ExtractionError {
        /// The archive being extracted.
        archive: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// No extractor exists for the archive format on this platform.
    #[error("unsupported archive format '{format}' for {platform}")]
    UnsupportedFormat {
        /// The archive format.
        format: String,
        /// The platform the archive was requested for.
        platform: String,
    },

    /// A toolchain root is missing one of its executables.
    #[error("{tool} not found in toolchain at {root}")]
    ExecutableNotFound {
        /// `node`, `npm` or `npx`.
        tool: String,
        /// The toolchain root that was searched.
        root: PathBuf,
    },

    /// Waiting for the cache lock exceeded the configured timeout.
    #[error("timed out after {waited_secs}s waiting for lock {path}")]
    LockTimeout {
        /// The lock file.
        path: PathBuf,
        /// Seconds spent waiting.
        waited_secs: u64,
    },

    /// The lock is held but its recorded owner process no longer exists.
    #[error("lock {path} is held but its owner (pid {pid}) is gone")]
    LockHolderDead {
        /// The lock file.
        path: PathBuf,
        /// The pid recorded by the holder.
        pid: u32,
    },

    /// Filesystem error with context.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the operation that failed.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be loaded.
    #[error("invalid configuration at {path}: {reason}")]
    Config {
        /// The configuration file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

impl ToolchainError {
    /// Creates a new `Io` error from an I/O error with context.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Creates a new `InvalidVersionSpec` error.
    #[must_use]
    pub fn invalid_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVersionSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `IndexUnavailable` error.
    #[must_use]
    pub fn index_unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IndexUnavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `UnresolvableVersion` error.
    #[must_use]
    pub fn unresolvable(spec: impl Into<String>, target: impl Into<String>) -> Self {
        Self::UnresolvableVersion {
            spec: spec.into(),
            target: target.into(),
        }
    }

    /// Creates a new `ExtractionError`.
    #[must_use]
    pub fn extraction(archive: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ExtractionError {
            archive: archive.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `ExecutableNotFound` error.
    #[must_use]
    pub fn executable_not_found(tool: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::ExecutableNotFound {
            tool: tool.into(),
            root: root.into(),
        }
    }

    /// Returns whether the error leaves the cache entry it was raised for
    /// untrustworthy, so the entry should be invalidated and re-acquired.
    #[must_use]
    pub fn is_cache_corruption(&self) -> bool {
        matches!(self, Self::ExecutableNotFound { .. })
    }

    /// Returns whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::IndexUnavailable { .. } | Self::DownloadFailed { .. } | Self::LockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_names_spec_and_target() {
        let err = ToolchainError::unresolvable("^99", "linux-x64");
        assert_eq!(
            err.to_string(),
            "no Node.js release satisfies '^99' for linux-x64"
        );
    }

    #[test]
    fn integrity_error_displays_both_digests() {
        let err = ToolchainError::IntegrityError {
            url: "https://nodejs.org/dist/v18.17.0/node.tar.gz".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("expected abc123"));
        assert!(msg.contains("got def456"));
    }

    #[test]
    fn executable_not_found_is_cache_corruption() {
        let err = ToolchainError::executable_not_found("npm", "/cache/node-v18.17.0-linux-x64");
        assert!(err.is_cache_corruption());
        assert_eq!(
            err.to_string(),
            "npm not found in toolchain at /cache/node-v18.17.0-linux-x64"
        );
    }

    #[test]
    fn io_error_keeps_source() {
        use std::error::Error as _;

        let err = ToolchainError::io(
            "reading index",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(!err.is_cache_corruption());
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "I/O error: reading index");
    }

    #[test]
    fn lock_errors_name_the_lock_file() {
        let timeout = ToolchainError::LockTimeout {
            path: PathBuf::from("/cache/locks/k.lock"),
            waited_secs: 30,
        };
        assert!(timeout.to_string().contains("/cache/locks/k.lock"));

        let dead = ToolchainError::LockHolderDead {
            path: PathBuf::from("/cache/locks/k.lock"),
            pid: 4242,
        };
        assert!(dead.to_string().contains("pid 4242"));
    }

    #[test]
    fn transient_errors_are_retryable() {
        let timeout = ToolchainError::LockTimeout {
            path: PathBuf::from("/cache/locks/node-v18.17.0-linux-x64.lock"),
            waited_secs: 30,
        };
        assert!(timeout.is_transient());
        let unreachable =
            ToolchainError::index_unavailable("https://nodejs.org/dist/index.json", "down");
        assert!(unreachable.is_transient());

        let mismatch = ToolchainError::IntegrityError {
            url: "https://nodejs.org/dist/v18.17.0/node.tar.gz".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert!(!mismatch.is_transient());
        assert!(!ToolchainError::unresolvable("^99", "linux-x64").is_transient());
    }
}
