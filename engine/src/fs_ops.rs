//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Clearing a target directory in place
//! - Copying trees with attribute preservation (snapshot restores)
//! - Durable writes (temp file, fsync, rename)
//! - Counting the files and bytes of a tree

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::EngineError;

/// Suffix for files that are being written and not yet visible.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Files and bytes below a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

fn walk_error(root: &Path, e: walkdir::Error) -> EngineError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    EngineError::EnumerationFailed {
        path,
        source: e
            .into_io_error()
            .unwrap_or_else(|| io::Error::other("filesystem loop detected")),
    }
}

/// Count regular files and symlinks below `root` and sum their sizes.
pub fn tree_stats(root: &Path) -> Result<TreeStats, EngineError> {
    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if entry.file_type().is_dir() {
            continue;
        }
        stats.files += 1;
        if entry.file_type().is_file() {
            let metadata = entry.metadata().map_err(|e| walk_error(root, e))?;
            stats.bytes += metadata.len();
        }
    }
    Ok(stats)
}

/// Ensure `dir` exists and is a directory.
pub fn ensure_dir(dir: &Path) -> Result<(), EngineError> {
    match fs::metadata(dir) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|e| EngineError::DirectoryCreationFailed {
                path: dir.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(()),
    }
}

/// Remove every entry inside `dir`, keeping `dir` itself (it may be a mount
/// point). A missing `dir` is created empty.
pub fn clear_directory(dir: &Path) -> Result<(), EngineError> {
    ensure_dir(dir)?;

    let entries = fs::read_dir(dir).map_err(|e| EngineError::EnumerationFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| EngineError::EnumerationFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| EngineError::EnumerationFailed {
            path: path.clone(),
            source: e,
        })?;

        let result = if file_type.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| EngineError::RemoveFailed { path, source: e })?;
    }

    Ok(())
}

/// Copy a file from source to destination preserving permissions and
/// modification time. Returns the number of bytes copied.
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;

    let src_metadata = src_file.metadata().map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;

    let mut dst_file = fs::File::create(dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            EngineError::WriteError {
                path: dst.to_path_buf(),
                source: e,
            }
        } else {
            EngineError::ReadError {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;
    drop(dst_file);

    copy_attributes(&src_metadata, dst)?;
    Ok(bytes_copied)
}

/// Apply permissions and modification time from `metadata` to `dst`.
fn copy_attributes(metadata: &fs::Metadata, dst: &Path) -> Result<(), EngineError> {
    fs::set_permissions(dst, metadata.permissions()).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    let atime = filetime::FileTime::from_last_access_time(metadata);
    filetime::set_file_times(dst, atime, mtime).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), EngineError> {
    let link = fs::read_link(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    ensure_parent_dir_exists(dst)?;
    std::os::unix::fs::symlink(&link, dst).map_err(|e| EngineError::WriteError {
        path: dst.to_path_buf(),
        source: e,
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), EngineError> {
    // Symlinks are restored as the content they point to
    copy_file_with_metadata(src, dst).map(|_| ())
}

/// Recursively copy `src` into `dst`, preserving permissions, timestamps and
/// symlinks. `dst` must exist. Returns the files and bytes written.
pub fn copy_tree_preserving(src: &Path, dst: &Path) -> Result<TreeStats, EngineError> {
    let mut stats = TreeStats::default();
    // Directory attributes are applied after their contents, deepest first,
    // so writing files does not clobber the copied mtimes.
    let mut directories: Vec<(PathBuf, fs::Metadata)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| walk_error(src, e))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| EngineError::InvalidPath {
                path: entry.path().to_path_buf(),
                reason: format!("not below {}", src.display()),
            })?;
        let dest_path = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            ensure_dir(&dest_path)?;
            let metadata = entry.metadata().map_err(|e| walk_error(src, e))?;
            directories.push((dest_path, metadata));
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest_path)?;
            stats.files += 1;
        } else {
            stats.bytes += copy_file_with_metadata(entry.path(), &dest_path)?;
            stats.files += 1;
        }
    }

    for (path, metadata) in directories.iter().rev() {
        copy_attributes(metadata, path)?;
    }

    Ok(stats)
}

/// Resolve `path` to an absolute path.
///
/// The longest existing prefix is canonicalized; the missing remainder is
/// normalized lexically, so `a/missing/../b` and `a/b` resolve alike whether
/// or not `b` exists yet.
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut resolved = PathBuf::new();
    // Trailing components of `resolved` that do not exist on disk
    let mut missing = 0usize;
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                missing = missing.saturating_sub(1);
            }
            other => {
                resolved.push(other);
                if missing > 0 {
                    missing += 1;
                    continue;
                }
                match fs::canonicalize(&resolved) {
                    Ok(canonical) => resolved = canonical,
                    Err(_) => missing = 1,
                }
            }
        }
    }
    resolved
}

/// True when one path contains the other (or they are equal).
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Path used while `path` is being written.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Flush a directory entry so renames inside it survive a crash.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<(), EngineError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| EngineError::WriteError {
            path: dir.to_path_buf(),
            source: e,
        })
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<(), EngineError> {
    Ok(())
}

/// Atomically publish a fully written `.partial` file under its final name.
pub fn publish_partial(path: &Path) -> Result<(), EngineError> {
    let partial = partial_path(path);
    fs::rename(&partial, path).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })?;
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

/// Write `data` to `path` durably: write a `.partial` sibling, fsync it, then
/// rename it into place.
pub fn write_file_durable(path: &Path, data: &[u8]) -> Result<(), EngineError> {
    ensure_parent_dir_exists(path)?;
    let partial = partial_path(path);

    let write = || -> io::Result<()> {
        let mut file = fs::File::create(&partial)?;
        file.write_all(data)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&partial);
        return Err(EngineError::WriteError {
            path: path.to_path_buf(),
            source: e,
        });
    }

    publish_partial(path)
}
