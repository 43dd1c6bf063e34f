//! Backup verification and post-restore verification.
//!
//! The backup verifier is the gate in front of every restore: it recomputes
//! the digest of the tree a backup would produce, from the backup's own
//! contents, and compares it with the CHECKSUM recorded in its metadata.
//! Nothing outside the backup directory (and, for incremental backups, its
//! full parent) is read.
//!
//! The post-restore verifier digests the target after a restore and compares
//! it with the same recorded CHECKSUM.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive;
use crate::checksums::{checksum_directory, ChecksumAlgorithm, ChecksumValue, Manifest};
use crate::error::{EngineError, RestoreError};
use crate::metadata::BackupMetadata;
use crate::model::{Backup, BackupType, BACKUP_METADATA_FILE};

/// A backup that passed verification, with what it will restore.
#[derive(Debug, Clone)]
pub struct VerifiedBackup {
    pub backup: Backup,
    /// Full parent of an incremental backup
    pub parent: Option<Backup>,
    /// Tree the restore will produce
    pub manifest: Manifest,
}

fn verification_error(backup: &Path, reason: impl Into<String>) -> RestoreError {
    RestoreError::Verification {
        backup: backup.to_path_buf(),
        reason: reason.into(),
    }
}

/// Read a backup's metadata. Missing or malformed metadata is a verification
/// failure.
pub fn open_backup(path: &Path) -> Result<Backup, RestoreError> {
    if !path.is_dir() {
        return Err(verification_error(path, "backup directory does not exist"));
    }

    let metadata_path = path.join(BACKUP_METADATA_FILE);
    let metadata = BackupMetadata::read(&metadata_path)
        .map_err(|e| verification_error(path, format!("unreadable metadata: {}", e)))?;

    Ok(Backup {
        path: path.to_path_buf(),
        metadata,
    })
}

/// Manifest of a backup's own payload, ignoring any parent.
fn payload_manifest(
    backup: &Backup,
    algorithm: ChecksumAlgorithm,
) -> Result<Manifest, EngineError> {
    match backup.backup_type() {
        BackupType::Snapshot => {
            let data = backup.snapshot_dir();
            if !data.is_dir() {
                return Err(EngineError::InvalidPath {
                    path: data,
                    reason: "snapshot data directory is missing".to_string(),
                });
            }
            Manifest::from_directory(&data, algorithm)
        }
        _ => archive::manifest_of_archive(&backup.archive_path(), algorithm),
    }
}

fn check_digest(backup: &Backup, manifest: &Manifest) -> Result<(), RestoreError> {
    let recorded = &backup.metadata.checksum;
    let actual = manifest.digest();
    if &actual != recorded {
        return Err(verification_error(
            &backup.path,
            format!(
                "checksum mismatch: recorded {}, computed {}",
                recorded.to_string_with_algo(),
                actual.to_string_with_algo()
            ),
        ));
    }
    Ok(())
}

/// Locate and verify the full parent of an incremental backup.
fn verify_parent(backup: &Backup) -> Result<Backup, RestoreError> {
    let missing = |parent: Option<&Path>, reason: String| RestoreError::MissingDependency {
        backup: backup.path.clone(),
        parent: parent.map(Path::to_path_buf),
        reason,
    };

    let parent_path = backup
        .parent_path()
        .ok_or_else(|| missing(None, "no PARENT recorded in metadata".to_string()))?;

    if !parent_path.join(BACKUP_METADATA_FILE).is_file() {
        return Err(missing(
            Some(&parent_path),
            format!("full backup {} not found", parent_path.display()),
        ));
    }

    let parent = open_backup(&parent_path)?;
    if parent.backup_type() != &BackupType::Full {
        return Err(missing(
            Some(&parent_path),
            format!(
                "parent {} is a {} backup, not full",
                parent_path.display(),
                parent.backup_type()
            ),
        ));
    }

    let algorithm = parent.metadata.checksum.algorithm();
    let manifest = payload_manifest(&parent, algorithm)
        .map_err(|e| verification_error(&parent.path, e.to_string()))?;
    check_digest(&parent, &manifest)?;

    debug!(parent = %parent.path.display(), "verified full parent");
    Ok(parent)
}

/// Verify a backup, returning what it will restore.
///
/// Errors:
/// - `UnsupportedType` for a TYPE other than full, incremental or snapshot
/// - `MissingDependency` for an incremental backup without a usable parent
/// - `Verification` for missing metadata, unreadable payload or a mismatch
pub fn verify_backup(path: &Path) -> Result<VerifiedBackup, RestoreError> {
    let backup = open_backup(path)?;
    let algorithm = backup.metadata.checksum.algorithm();

    let (parent, manifest) = match backup.backup_type() {
        BackupType::Unsupported(name) => {
            return Err(RestoreError::UnsupportedType {
                backup: path.to_path_buf(),
                type_name: name.clone(),
            })
        }
        BackupType::Full | BackupType::Snapshot => {
            let manifest = payload_manifest(&backup, algorithm)
                .map_err(|e| verification_error(path, e.to_string()))?;
            (None, manifest)
        }
        BackupType::Incremental => {
            let parent = verify_parent(&backup)?;
            let mut manifest = payload_manifest(&parent, algorithm)
                .map_err(|e| verification_error(&parent.path, e.to_string()))?;
            let delta = payload_manifest(&backup, algorithm)
                .map_err(|e| verification_error(path, e.to_string()))?;
            manifest.overlay(delta);
            (Some(parent), manifest)
        }
    };

    check_digest(&backup, &manifest)?;

    info!(
        backup = %path.display(),
        backup_type = %backup.backup_type(),
        files = manifest.file_count(),
        "backup verified"
    );
    Ok(VerifiedBackup {
        backup,
        parent,
        manifest,
    })
}

/// Boolean form of `verify_backup`: false on mismatch, missing metadata,
/// unsupported type, missing parent or read errors.
pub fn verify(path: &Path) -> bool {
    match verify_backup(path) {
        Ok(_) => true,
        Err(e) => {
            warn!(backup = %path.display(), error = %e, "backup failed verification");
            false
        }
    }
}

/// Result of comparing a restored target with the expected checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCheck {
    pub expected: ChecksumValue,
    pub actual: ChecksumValue,
}

impl ResultCheck {
    pub fn passed(&self) -> bool {
        self.expected == self.actual
    }
}

/// Digest `target` with the expected checksum's algorithm and compare.
pub fn verify_restored(
    target: &Path,
    expected: &ChecksumValue,
) -> Result<ResultCheck, EngineError> {
    let actual = checksum_directory(target, expected.algorithm())?;
    Ok(ResultCheck {
        expected: expected.clone(),
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Fixture};
    use std::fs;

    #[test]
    fn test_full_backup_verifies() {
        let fx = Fixture::new();
        let backup = fx.full_backup("full-1", &[("a.txt", "alpha"), ("dir/b.txt", "beta")]);

        let verified = verify_backup(&backup).expect("full backup should verify");
        assert_eq!(verified.manifest.file_count(), 2);
        assert!(verified.parent.is_none());
        assert!(verify(&backup));
    }

    #[test]
    fn test_tampered_checksum_fails_verification() {
        let fx = Fixture::new();
        let backup = fx.full_backup("full-1", &[("a.txt", "alpha")]);
        testutil::set_meta(&backup, "CHECKSUM", &"0".repeat(64));

        let err = verify_backup(&backup).unwrap_err();
        assert!(matches!(err, RestoreError::Verification { .. }));
        assert!(!verify(&backup));
    }

    #[test]
    fn test_modified_payload_fails_verification() {
        let fx = Fixture::new();
        let backup = fx.snapshot_backup("snap-1", &[("a.txt", "alpha")]);
        fs::write(backup.join("data/a.txt"), "tampered").unwrap();

        assert!(matches!(
            verify_backup(&backup),
            Err(RestoreError::Verification { .. })
        ));
    }

    #[test]
    fn test_missing_metadata_fails_verification() {
        let fx = Fixture::new();
        let backup = fx.full_backup("full-1", &[("a.txt", "alpha")]);
        fs::remove_file(backup.join(BACKUP_METADATA_FILE)).unwrap();

        assert!(matches!(
            verify_backup(&backup),
            Err(RestoreError::Verification { .. })
        ));
        assert!(!verify(&fx.backups.join("does-not-exist")));
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let fx = Fixture::new();
        let backup = fx.full_backup("odd", &[("a.txt", "alpha")]);
        testutil::set_meta(&backup, "TYPE", "differential");

        match verify_backup(&backup) {
            Err(RestoreError::UnsupportedType { type_name, .. }) => {
                assert_eq!(type_name, "differential")
            }
            other => panic!("expected UnsupportedType, got {:?}", other),
        }
    }

    #[test]
    fn test_incremental_verifies_against_parent_overlay() {
        let fx = Fixture::new();
        fx.full_backup("full-1", &[("config", "v1"), ("keep", "k")]);
        let inc = fx.incremental_backup("inc-1", "full-1", &[("config", "v2"), ("new", "n")]);

        let verified = verify_backup(&inc).expect("incremental should verify");
        assert_eq!(verified.manifest.file_count(), 3);
        assert!(verified.parent.is_some());
    }

    #[test]
    fn test_incremental_without_parent_is_missing_dependency() {
        let fx = Fixture::new();
        fx.full_backup("full-1", &[("config", "v1")]);
        let inc = fx.incremental_backup("inc-1", "full-1", &[("config", "v2")]);
        fs::remove_dir_all(fx.backups.join("full-1")).unwrap();

        assert!(matches!(
            verify_backup(&inc),
            Err(RestoreError::MissingDependency { parent: Some(_), .. })
        ));
    }

    #[test]
    fn test_incremental_with_non_full_parent_is_missing_dependency() {
        let fx = Fixture::new();
        fx.snapshot_backup("snap-1", &[("config", "v1")]);
        let inc = fx.incremental_backup("inc-1", "snap-1", &[("config", "v2")]);

        assert!(matches!(
            verify_backup(&inc),
            Err(RestoreError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_verify_restored_compares_tree_digest() {
        let fx = Fixture::new();
        let backup = fx.snapshot_backup("snap-1", &[("a.txt", "alpha")]);
        let verified = verify_backup(&backup).unwrap();

        let check =
            verify_restored(&backup.join("data"), &verified.backup.metadata.checksum).unwrap();
        assert!(check.passed());

        let other = fx.tree("other", &[("a.txt", "beta")]);
        let check = verify_restored(&other, &verified.backup.metadata.checksum).unwrap();
        assert!(!check.passed());
    }
}
