#![warn(clippy::pedantic)]
//! Node.js toolchain acquisition for build processes.
//!
//! A build that needs `node`, `npm` and `npx` asks for a version spec and
//! receives concrete executable paths. A satisfying system installation is
//! used when allowed; otherwise the matching upstream release is downloaded,
//! verified against its published SHA-256, extracted, and kept in a shared
//! on-disk cache that any number of concurrent builds can use safely.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn build() -> nodekit_toolchain::ToolchainResult<()> {
//! let handle = nodekit_toolchain::acquire_toolchain("^18", true, None).await?;
//! println!("node at {}", handle.node.display());
//! # Ok(())
//! # }
//! ```
//!
//! Callers that need a mirror, TTL, retry or lock policy build a
//! [`Toolchain`] from [`ToolchainOptions`].
//!
//! ## Module Structure
//!
//! - [`platform`] - host detection, upstream naming, executable layout
//! - [`version_spec`] - requirement strings (exact, npm ranges, tags)
//! - [`index`] - release index and checksum lists with a TTL cache
//! - [`resolver`] - spec to release descriptor or system installation
//! - [`download`] - verified archive download with retries
//! - [`archive`] - tar.gz and zip extraction with path containment
//! - [`cache`] - atomic, key-addressed toolchain store
//! - [`lock`] - per-key locking across processes or within one
//! - [`locate`] - executables in a toolchain root or on `PATH`
//! - [`toolchain`] - the acquisition entry point
//! - [`config`], [`paths`], [`package`], [`errors`] - options, cache layout,
//!   `package.json` engines, error types

pub mod archive;
pub mod cache;
pub mod config;
pub mod download;
pub mod errors;
pub mod index;
pub mod locate;
pub mod lock;
pub mod package;
pub mod paths;
pub mod platform;
pub mod resolver;
pub mod toolchain;
pub mod version_spec;

pub use cache::{CacheEntry, CacheKey, CacheState, CacheStore};
pub use config::ToolchainOptions;
pub use errors::{ToolchainError, ToolchainResult};
pub use lock::{FileLocker, KeyLocker, MemoryLocker};
pub use paths::CacheLayout;
pub use platform::{Arch, HostTarget, Platform};
pub use resolver::{ReleaseDescriptor, Resolution};
pub use toolchain::{Toolchain, ToolchainHandle, ToolchainSource, acquire_toolchain};
pub use version_spec::VersionSpec;
