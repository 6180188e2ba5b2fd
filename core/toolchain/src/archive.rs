//! Extraction of verified toolchain archives.
//!
//! Upstream archives wrap everything in one top-level directory
//! (`node-v18.17.0-linux-x64/`), which is stripped so the destination becomes
//! the toolchain root. Tarball symlinks such as
//! `bin/npm -> ../lib/node_modules/npm/bin/npm-cli.js` are preserved, as long
//! as they resolve inside the destination. Entries may not be written through
//! a symlink extracted earlier.
//!
//! Extraction is blocking; async callers should run it on a blocking thread.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

use crate::errors::{ToolchainError, ToolchainResult};
use crate::platform::{ArchiveFormat, Platform, Tool};

/// Extracts `archive` into `destination` and normalises executable modes.
///
/// `format` must be the format `platform` publishes; the archive's contents
/// are not sniffed.
///
/// # Errors
///
/// - `UnsupportedFormat` if `format` is not the one used for `platform`
/// - `ExtractionError` if the archive is truncated, corrupt, or contains
///   entries (or link targets) outside the destination
pub fn extract(
    archive: &Path,
    destination: &Path,
    format: ArchiveFormat,
    platform: Platform,
) -> ToolchainResult<()> {
    if platform.archive_format() != format {
        return Err(ToolchainError::UnsupportedFormat {
            format: format.to_string(),
            platform: platform.to_string(),
        });
    }

    std::fs::create_dir_all(destination).map_err(|e| {
        ToolchainError::io(format!("creating directory {}", destination.display()), e)
    })?;

    match format {
        ArchiveFormat::TarGz => extract_tar_gz(archive, destination)?,
        ArchiveFormat::Zip => extract_zip(archive, destination)?,
    }

    #[cfg(unix)]
    set_executable_permissions(destination, platform)?;

    debug!(archive = %archive.display(), destination = %destination.display(), "extracted archive");
    Ok(())
}

fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> ToolchainResult<()> {
    let fail = |reason: String| ToolchainError::extraction(archive_path, reason);

    let strip_prefix = find_common_root_folder_tar(archive_path)?;

    let mut archive = open_tar(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|e| fail(format!("failed to read tar entries: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| fail(format!("failed to read tar entry: {e}")))?;
        let kind = entry.header().entry_type();
        if is_metadata_entry(kind) {
            continue;
        }

        let entry_path = entry
            .path()
            .map_err(|e| fail(format!("invalid entry path: {e}")))?
            .into_owned();
        ensure_relative(&entry_path).map_err(fail)?;

        let Some(relative_path) = strip(&entry_path, strip_prefix.as_deref()) else {
            continue;
        };
        ensure_no_symlink_ancestor(dest_dir, &relative_path).map_err(fail)?;
        let output_path = dest_dir.join(&relative_path);

        if kind.is_dir() {
            create_dir(&output_path)?;
            continue;
        }
        if let Some(parent) = output_path.parent() {
            create_dir(parent)?;
        }

        if kind.is_symlink() {
            let target = entry
                .link_name()
                .map_err(|e| fail(format!("invalid link target: {e}")))?
                .ok_or_else(|| fail(format!("symlink {} has no target", entry_path.display())))?;
            if !link_stays_inside(&relative_path, &target) {
                return Err(fail(format!(
                    "symlink {} points outside the archive: {}",
                    entry_path.display(),
                    target.display()
                )));
            }
        } else if kind.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(|e| fail(format!("invalid link target: {e}")))?
                .ok_or_else(|| fail(format!("hard link {} has no target", entry_path.display())))?
                .into_owned();
            ensure_relative(&target).map_err(fail)?;
            let source = strip(&target, strip_prefix.as_deref())
                .ok_or_else(|| fail(format!("hard link {} has no target", entry_path.display())))?;
            ensure_no_symlink_ancestor(dest_dir, &source).map_err(fail)?;
            std::fs::hard_link(dest_dir.join(source), &output_path)
                .map_err(|e| fail(format!("failed to link {}: {e}", output_path.display())))?;
            continue;
        }

        entry
            .unpack(&output_path)
            .map_err(|e| fail(format!("failed to extract {}: {e}", output_path.display())))?;
    }

    Ok(())
}

fn open_tar(archive_path: &Path) -> ToolchainResult<Archive<GzDecoder<File>>> {
    let file = File::open(archive_path)
        .map_err(|e| ToolchainError::io(format!("opening {}", archive_path.display()), e))?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// Finds a top-level folder shared by every tar entry.
///
/// Returns `None` unless all entries share the first component and at least
/// one entry is nested below it, so flat archives are left alone.
fn find_common_root_folder_tar(archive_path: &Path) -> ToolchainResult<Option<PathBuf>> {
    let fail = |reason: String| ToolchainError::extraction(archive_path, reason);

    let mut archive = open_tar(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|e| fail(format!("failed to read tar entries: {e}")))?;

    let mut roots = CommonRoot::default();
    for entry in entries {
        let entry = entry.map_err(|e| fail(format!("failed to read tar entry: {e}")))?;
        if is_metadata_entry(entry.header().entry_type()) {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| fail(format!("invalid entry path: {e}")))?;
        if !roots.observe(&path) {
            return Ok(None);
        }
    }

    Ok(roots.finish())
}

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> ToolchainResult<()> {
    let fail = |reason: String| ToolchainError::extraction(archive_path, reason);

    let file = File::open(archive_path)
        .map_err(|e| ToolchainError::io(format!("opening {}", archive_path.display()), e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| fail(format!("invalid zip archive: {e}")))?;

    let strip_prefix = find_common_root_folder_zip(&mut archive);

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| fail(format!("failed to read zip entry {i}: {e}")))?;

        let entry_path = entry
            .enclosed_name()
            .ok_or_else(|| fail(format!("unsafe entry path: {}", entry.name())))?;
        ensure_relative(&entry_path).map_err(fail)?;

        let Some(relative_path) = strip(&entry_path, strip_prefix.as_deref()) else {
            continue;
        };
        let output_path = dest_dir.join(&relative_path);

        if entry.is_dir() {
            create_dir(&output_path)?;
            continue;
        }
        if let Some(parent) = output_path.parent() {
            create_dir(parent)?;
        }

        let mut outfile = File::create(&output_path)
            .map_err(|e| ToolchainError::io(format!("creating {}", output_path.display()), e))?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| fail(format!("failed to extract {}: {e}", output_path.display())))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&output_path, std::fs::Permissions::from_mode(mode & 0o777))
                .map_err(|e| {
                    ToolchainError::io(format!("setting mode on {}", output_path.display()), e)
                })?;
        }
    }

    Ok(())
}

/// Zip counterpart of [`find_common_root_folder_tar`].
fn find_common_root_folder_zip<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Option<PathBuf> {
    let mut roots = CommonRoot::default();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).ok()?;
        let path = entry.enclosed_name()?;
        if !roots.observe(&path) {
            return None;
        }
    }
    roots.finish()
}

/// Accumulates the shared first path component across archive entries.
#[derive(Default)]
struct CommonRoot {
    root: Option<PathBuf>,
    nested: bool,
}

impl CommonRoot {
    /// Records `path`; returns `false` once entries disagree on the root.
    fn observe(&mut self, path: &Path) -> bool {
        let mut components = path.components().filter(|c| !matches!(c, Component::CurDir));
        let Some(first) = components.next() else {
            return true;
        };
        if components.next().is_some() {
            self.nested = true;
        }
        let first = PathBuf::from(first.as_os_str());
        match &self.root {
            None => {
                self.root = Some(first);
                true
            }
            Some(existing) => *existing == first,
        }
    }

    fn finish(self) -> Option<PathBuf> {
        if self.nested { self.root } else { None }
    }
}

/// Strips `prefix` from `path`. Returns `None` for the prefix directory itself.
fn strip(path: &Path, prefix: Option<&Path>) -> Option<PathBuf> {
    let path: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    let relative = match prefix {
        Some(prefix) => path.strip_prefix(prefix).map_or_else(|_| path.clone(), Path::to_path_buf),
        None => path,
    };
    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// Rejects absolute paths and `..` components.
fn ensure_relative(path: &Path) -> Result<(), String> {
    let unsafe_path = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if unsafe_path {
        Err(format!(
            "refusing to extract path with parent directory or absolute reference: {}",
            path.display()
        ))
    } else {
        Ok(())
    }
}

/// Rejects `relative` if any of its parent directories inside `root` is a
/// symlink, so earlier links cannot redirect later entries.
fn ensure_no_symlink_ancestor(root: &Path, relative: &Path) -> Result<(), String> {
    let mut current = root.to_path_buf();
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    for component in parent.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(format!(
                    "refusing to extract {} through symlink {}",
                    relative.display(),
                    current.display()
                ));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

/// Whether a symlink at `link` (relative to the destination) pointing at
/// `target` resolves inside the destination.
fn link_stays_inside(link: &Path, target: &Path) -> bool {
    let mut depth = link.parent().map_or(0usize, |p| {
        p.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .count()
    });
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(d) => depth = d,
                None => return false,
            },
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

fn is_metadata_entry(kind: EntryType) -> bool {
    matches!(
        kind,
        EntryType::XGlobalHeader
            | EntryType::XHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink
    )
}

fn create_dir(path: &Path) -> ToolchainResult<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| ToolchainError::io(format!("creating directory {}", path.display()), e))
}

/// Sets mode 0o755 on every tool the layout names. Symlinks are followed;
/// missing tools are left for the locator to report.
#[cfg(unix)]
fn set_executable_permissions(root: &Path, platform: Platform) -> ToolchainResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let layout = platform.layout();
    for tool in Tool::ALL {
        for candidate in layout.candidates(tool) {
            let path = root.join(candidate);
            if !path.is_file() {
                continue;
            }
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| ToolchainError::io(format!("setting mode on {}", path.display()), e))?;
        }
    }
    Ok(())
}
