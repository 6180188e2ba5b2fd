//! Host platform detection and per-platform naming.
//!
//! Everything that differs between POSIX and Windows toolchains lives in this
//! module: the upstream OS and architecture names, the archive format, the file
//! identifiers used by the release index, and the executable [`Layout`] inside
//! an extracted toolchain. Callers dispatch through these tables instead of
//! branching on `cfg!` themselves.
//!
//! ## Upstream naming
//!
//! | Platform | Archive                              | Index file id      |
//! |----------|--------------------------------------|--------------------|
//! | Linux    | `node-v18.17.0-linux-x64.tar.gz`     | `linux-x64`        |
//! | macOS    | `node-v18.17.0-darwin-arm64.tar.gz`  | `osx-arm64-tar`    |
//! | Windows  | `node-v18.17.0-win-x64.zip`          | `win-x64-zip`      |

use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::errors::{ToolchainError, ToolchainResult};

/// Operating system family of a toolchain build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Linux (glibc builds).
    Linux,
    /// macOS.
    Darwin,
    /// Windows.
    Windows,
}

/// CPU architecture of a toolchain build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// `x86_64`.
    X64,
    /// `aarch64`.
    Arm64,
    /// Little-endian 64-bit POWER.
    Ppc64le,
    /// IBM Z.
    S390x,
    /// 32-bit ARMv7.
    Armv7l,
}

/// Archive formats published upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// gzip-compressed tarball.
    TarGz,
    /// zip.
    Zip,
}

/// The executables a toolchain provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// The `node` runtime.
    Node,
    /// The `npm` package manager.
    Npm,
    /// The `npx` runner.
    Npx,
}

/// Relative paths of each tool inside an extracted toolchain, in lookup order.
#[derive(Debug)]
pub struct Layout {
    node: &'static [&'static str],
    npm: &'static [&'static str],
    npx: &'static [&'static str],
}

const POSIX_LAYOUT: Layout = Layout {
    node: &["bin/node"],
    npm: &["bin/npm"],
    npx: &["bin/npx"],
};

const WINDOWS_LAYOUT: Layout = Layout {
    node: &["node.exe"],
    npm: &["npm.cmd", "npm.exe", "npm"],
    npx: &["npx.cmd", "npx.exe", "npx"],
};

impl Layout {
    /// Candidate relative paths for `tool`, most preferred first.
    #[must_use]
    pub fn candidates(&self, tool: Tool) -> &'static [&'static str] {
        match tool {
            Tool::Node => self.node,
            Tool::Npm => self.npm,
            Tool::Npx => self.npx,
        }
    }

    /// Directory (relative to the toolchain root) holding the executables.
    #[must_use]
    pub fn bin_dir(&self) -> &'static str {
        match self.node.first().and_then(|p| p.rsplit_once('/')) {
            Some((dir, _)) => dir,
            None => "",
        }
    }
}

impl Tool {
    /// All tools, in the order they are reported.
    pub const ALL: [Tool; 3] = [Tool::Node, Tool::Npm, Tool::Npx];

    /// The tool's command name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Npm => "npm",
            Self::Npx => "npx",
        }
    }
}

impl Platform {
    /// Returns the platform of the running host.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` on operating systems without upstream builds.
    pub fn detect() -> ToolchainResult<Self> {
        match std::env::consts::OS {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::Darwin),
            "windows" => Ok(Self::Windows),
            os => Err(ToolchainError::UnsupportedPlatform {
                os: os.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            }),
        }
    }

    /// Returns the identifier used in cache keys.
    #[must_use = "returns the platform string without side effects"]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "windows",
        }
    }

    /// Returns the OS component of upstream archive names.
    #[must_use]
    pub fn dist_os(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
            Self::Windows => "win",
        }
    }

    /// Returns the archive format upstream publishes for this platform.
    #[must_use]
    pub fn archive_format(self) -> ArchiveFormat {
        match self {
            Self::Windows => ArchiveFormat::Zip,
            Self::Linux | Self::Darwin => ArchiveFormat::TarGz,
        }
    }

    /// Returns the executable layout of an extracted toolchain.
    #[must_use]
    pub fn layout(self) -> &'static Layout {
        match self {
            Self::Windows => &WINDOWS_LAYOUT,
            Self::Linux | Self::Darwin => &POSIX_LAYOUT,
        }
    }

    /// Parses the identifier produced by [`Platform::as_str`].
    #[must_use]
    pub fn from_key(s: &str) -> Option<Self> {
        match s {
            "linux" => Some(Self::Linux),
            "darwin" => Some(Self::Darwin),
            "windows" => Some(Self::Windows),
            _ => None,
        }
    }
}

impl Arch {
    /// Returns the architecture of the running host.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` for architectures without upstream builds.
    pub fn detect() -> ToolchainResult<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Self::X64),
            "aarch64" => Ok(Self::Arm64),
            "powerpc64" if cfg!(target_endian = "little") => Ok(Self::Ppc64le),
            "s390x" => Ok(Self::S390x),
            "arm" => Ok(Self::Armv7l),
            arch => Err(ToolchainError::UnsupportedPlatform {
                os: std::env::consts::OS.to_string(),
                arch: arch.to_string(),
            }),
        }
    }

    /// Returns the upstream architecture name.
    #[must_use = "returns the arch string without side effects"]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Arm64 => "arm64",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
            Self::Armv7l => "armv7l",
        }
    }

    /// Parses the identifier produced by [`Arch::as_str`].
    #[must_use]
    pub fn from_key(s: &str) -> Option<Self> {
        match s {
            "x64" => Some(Self::X64),
            "arm64" => Some(Self::Arm64),
            "ppc64le" => Some(Self::Ppc64le),
            "s390x" => Some(Self::S390x),
            "armv7l" => Some(Self::Armv7l),
            _ => None,
        }
    }
}

/// A platform/architecture pair a toolchain is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostTarget {
    /// Operating system family.
    pub platform: Platform,
    /// CPU architecture.
    pub arch: Arch,
}

impl HostTarget {
    /// Creates a target from its parts.
    #[must_use]
    pub const fn new(platform: Platform, arch: Arch) -> Self {
        Self { platform, arch }
    }

    /// Detects the running host.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedPlatform` if the OS/architecture combination has no
    /// upstream build.
    pub fn detect() -> ToolchainResult<Self> {
        let target = Self::new(Platform::detect()?, Arch::detect()?);
        if target.is_published() {
            Ok(target)
        } else {
            Err(ToolchainError::UnsupportedPlatform {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            })
        }
    }

    /// Whether upstream publishes builds for this combination at all.
    #[must_use]
    pub fn is_published(self) -> bool {
        match self.platform {
            Platform::Linux => true,
            Platform::Darwin | Platform::Windows => {
                matches!(self.arch, Arch::X64 | Arch::Arm64)
            }
        }
    }

    /// The identifier the release index lists in a release's `files` when a
    /// build for this target exists.
    #[must_use]
    pub fn index_file_id(self) -> String {
        let arch = self.arch.as_str();
        match self.platform {
            Platform::Linux => format!("linux-{arch}"),
            Platform::Darwin => format!("osx-{arch}-tar"),
            Platform::Windows => format!("win-{arch}-zip"),
        }
    }

    /// The upstream archive file name for `version`.
    #[must_use]
    pub fn archive_name(self, version: &Version) -> String {
        let ext = match self.platform.archive_format() {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Zip => "zip",
        };
        format!(
            "node-v{version}-{}-{}.{ext}",
            self.platform.dist_os(),
            self.arch.as_str()
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.platform, self.arch)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TarGz => f.write_str("tar.gz"),
            Self::Zip => f.write_str("zip"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).expect("Should parse version")
    }

    #[test]
    fn archive_name_follows_upstream_convention() {
        let linux = HostTarget::new(Platform::Linux, Arch::X64);
        let mac = HostTarget::new(Platform::Darwin, Arch::Arm64);
        let win = HostTarget::new(Platform::Windows, Arch::X64);

        assert_eq!(
            linux.archive_name(&v("18.17.0")),
            "node-v18.17.0-linux-x64.tar.gz"
        );
        assert_eq!(
            mac.archive_name(&v("20.5.1")),
            "node-v20.5.1-darwin-arm64.tar.gz"
        );
        assert_eq!(win.archive_name(&v("18.17.0")), "node-v18.17.0-win-x64.zip");
    }

    #[test]
    fn index_file_id_matches_release_index_naming() {
        assert_eq!(
            HostTarget::new(Platform::Linux, Arch::Arm64).index_file_id(),
            "linux-arm64"
        );
        assert_eq!(
            HostTarget::new(Platform::Darwin, Arch::X64).index_file_id(),
            "osx-x64-tar"
        );
        assert_eq!(
            HostTarget::new(Platform::Windows, Arch::Arm64).index_file_id(),
            "win-arm64-zip"
        );
    }

    #[test]
    fn layout_table_covers_every_tool() {
        for platform in [Platform::Linux, Platform::Darwin, Platform::Windows] {
            for tool in Tool::ALL {
                assert!(
                    !platform.layout().candidates(tool).is_empty(),
                    "{platform} has no candidates for {}",
                    tool.as_str()
                );
            }
        }
    }

    #[test]
    fn windows_layout_prefers_cmd_wrappers() {
        let layout = Platform::Windows.layout();
        assert_eq!(layout.candidates(Tool::Node), ["node.exe"]);
        assert_eq!(layout.candidates(Tool::Npm)[0], "npm.cmd");
        assert_eq!(layout.candidates(Tool::Npx)[0], "npx.cmd");
        assert_eq!(layout.bin_dir(), "");
    }

    #[test]
    fn posix_layout_uses_bin_dir() {
        let layout = Platform::Linux.layout();
        assert_eq!(layout.candidates(Tool::Node), ["bin/node"]);
        assert_eq!(layout.bin_dir(), "bin");
    }

    #[test]
    fn archive_format_is_chosen_by_platform() {
        assert_eq!(Platform::Linux.archive_format(), ArchiveFormat::TarGz);
        assert_eq!(Platform::Darwin.archive_format(), ArchiveFormat::TarGz);
        assert_eq!(Platform::Windows.archive_format(), ArchiveFormat::Zip);
    }

    #[test]
    fn key_identifiers_round_trip() {
        for platform in [Platform::Linux, Platform::Darwin, Platform::Windows] {
            assert_eq!(Platform::from_key(platform.as_str()), Some(platform));
        }
        for arch in [
            Arch::X64,
            Arch::Arm64,
            Arch::Ppc64le,
            Arch::S390x,
            Arch::Armv7l,
        ] {
            assert_eq!(Arch::from_key(arch.as_str()), Some(arch));
        }
        assert_eq!(Platform::from_key("win"), None);
    }

    #[test]
    fn darwin_and_windows_only_publish_x64_and_arm64() {
        assert!(HostTarget::new(Platform::Linux, Arch::S390x).is_published());
        assert!(!HostTarget::new(Platform::Darwin, Arch::S390x).is_published());
        assert!(!HostTarget::new(Platform::Windows, Arch::Armv7l).is_published());
    }

    #[test]
    fn detect_returns_target_on_supported_system() {
        let result = HostTarget::detect();
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        assert!(matches!(
            result,
            Ok(HostTarget {
                platform: Platform::Linux,
                arch: Arch::X64
            })
        ));

        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        assert!(matches!(
            result,
            Ok(HostTarget {
                platform: Platform::Darwin,
                arch: Arch::Arm64
            })
        ));

        let _ = result;
    }
}
