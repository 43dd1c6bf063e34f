//! Gzip-compressed tar archives.
//!
//! Used for restoration points (written by this crate) and for full and
//! incremental backups (written by an external producer, read here).

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType};
use tracing::debug;
use walkdir::WalkDir;

use crate::checksums::{
    compute_reader_checksum, manifest_key, ChecksumAlgorithm, Manifest, ManifestEntry,
};
use crate::error::EngineError;
use crate::fs_ops::TreeStats;

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>, EngineError> {
    let file = File::open(path).map_err(|e| EngineError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

/// Pack every entry below `src` into a gzip-compressed tar at `archive_path`.
///
/// Symlinks are stored as links, not followed. Levels above 9 are clamped.
/// The archive is fsynced before returning.
pub fn pack_directory(
    src: &Path,
    archive_path: &Path,
    compression_level: u32,
) -> Result<TreeStats, EngineError> {
    let file = File::create(archive_path).map_err(|e| EngineError::WriteError {
        path: archive_path.to_path_buf(),
        source: e,
    })?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(compression_level.min(9)));
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = TreeStats::default();
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
            EngineError::EnumerationFailed {
                path,
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop detected")),
            }
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| EngineError::InvalidPath {
                path: entry.path().to_path_buf(),
                reason: format!("not below {}", src.display()),
            })?;
        let name = manifest_key(relative)?;

        let file_type = entry.file_type();
        let result = if file_type.is_dir() {
            builder.append_dir(&name, entry.path())
        } else {
            if file_type.is_file() {
                stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
            stats.files += 1;
            builder.append_path_with_name(entry.path(), &name)
        };
        result.map_err(|e| {
            EngineError::archive_io(archive_path, format!("failed to add {}", name), e)
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| EngineError::archive_io(archive_path, "failed to finalize tar stream", e))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| EngineError::archive_io(archive_path, "failed to finish compression", e))?;
    writer.flush().map_err(|e| EngineError::WriteError {
        path: archive_path.to_path_buf(),
        source: e,
    })?;
    let file = writer.into_inner().map_err(|e| EngineError::WriteError {
        path: archive_path.to_path_buf(),
        source: e.into_error(),
    })?;
    file.sync_all().map_err(|e| EngineError::WriteError {
        path: archive_path.to_path_buf(),
        source: e,
    })?;

    debug!(
        archive = %archive_path.display(),
        files = stats.files,
        bytes = stats.bytes,
        "packed directory"
    );
    Ok(stats)
}

/// Extract `archive_path` into `dest`, overwriting entries that already
/// exist. Permissions and modification times are preserved. Entries that
/// would land outside `dest` abort the extraction.
pub fn unpack_into(archive_path: &Path, dest: &Path) -> Result<TreeStats, EngineError> {
    let mut archive = open_archive(archive_path)?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| EngineError::archive_io(archive_path, "failed to read entries", e))?;

    let mut stats = TreeStats::default();
    for entry in entries {
        let mut entry =
            entry.map_err(|e| EngineError::archive_io(archive_path, "corrupt entry", e))?;
        let entry_type = entry.header().entry_type();
        let size = entry.header().size().unwrap_or(0);
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<invalid path>".to_string());

        let unpacked = entry.unpack_in(dest).map_err(|e| {
            EngineError::archive_io(archive_path, format!("failed to extract {}", name), e)
        })?;
        if !unpacked {
            return Err(EngineError::archive(
                archive_path,
                format!("entry {} escapes the destination", name),
            ));
        }

        if !entry_type.is_dir() {
            stats.files += 1;
            if entry_type.is_file() {
                stats.bytes += size;
            }
        }
    }

    debug!(
        archive = %archive_path.display(),
        dest = %dest.display(),
        files = stats.files,
        "unpacked archive"
    );
    Ok(stats)
}

/// Build the manifest of the tree an archive would produce, without
/// extracting it.
pub fn manifest_of_archive(
    archive_path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<Manifest, EngineError> {
    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|e| EngineError::archive_io(archive_path, "failed to read entries", e))?;

    let mut manifest = Manifest::new(algorithm);
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::archive_io(archive_path, "corrupt entry", e))?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| EngineError::archive_io(archive_path, "invalid entry path", e))?
            .into_owned();
        let key = manifest_key(&path)?;
        if key.is_empty() {
            continue;
        }

        match entry_type {
            EntryType::Regular | EntryType::Continuous => {
                let (checksum, size) = compute_reader_checksum(entry, archive_path, algorithm)?;
                manifest.insert(key, ManifestEntry { checksum, size });
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| EngineError::archive_io(archive_path, "invalid link name", e))?
                    .ok_or_else(|| {
                        EngineError::archive(archive_path, format!("symlink {} has no target", key))
                    })?
                    .into_owned();
                manifest.insert_symlink(key, &link);
            }
            EntryType::Link => {
                // Hard links carry the content of an earlier entry
                let link = entry
                    .link_name()
                    .map_err(|e| EngineError::archive_io(archive_path, "invalid link name", e))?
                    .ok_or_else(|| {
                        let reason = format!("hard link {} has no target", key);
                        EngineError::archive(archive_path, reason)
                    })?
                    .into_owned();
                let target_key = manifest_key(&link)?;
                let target = manifest.get(&target_key).cloned().ok_or_else(|| {
                    EngineError::archive(
                        archive_path,
                        format!("hard link {} points at unknown entry {}", key, target_key),
                    )
                })?;
                manifest.insert(key, target);
            }
            EntryType::XGlobalHeader | EntryType::XHeader | EntryType::GNULongName
            | EntryType::GNULongLink => {}
            other => {
                return Err(EngineError::archive(
                    archive_path,
                    format!("unsupported entry type {:?} for {}", other, key),
                ))
            }
        }
    }

    Ok(manifest)
}

/// Size of a file on disk, 0 if it cannot be read.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
