//! Restoration point manager.
//!
//! A restoration point is a compressed capture of a target directory taken
//! before a restore clears it, stored as a pair of files sharing one stem:
//!
//! ```text
//! <points_dir>/rp-20260102-030405-678.tar.gz
//! <points_dir>/rp-20260102-030405-678.meta
//! ```
//!
//! Both halves are written under `.partial` names and renamed into place,
//! archive first, so a visible `.meta` always has a complete archive beside
//! it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::archive;
use crate::checksums::{ChecksumValue, Manifest};
use crate::config::RestoreConfig;
use crate::error::{EngineError, RestoreError};
use crate::fs_ops::{self, TreeStats, PARTIAL_SUFFIX};
use crate::lock::TargetLock;
use crate::metadata::PointMetadata;
use crate::model::{PointSummary, RestorationPoint};
use crate::verify::{self, ResultCheck};

pub const POINT_ARCHIVE_EXT: &str = "tar.gz";
pub const POINT_METADATA_EXT: &str = "meta";
const POINT_PREFIX: &str = "rp-";

/// Id for a point created at `timestamp`, before collision suffixes.
pub fn point_id_for(timestamp: DateTime<Utc>) -> String {
    format!("{}{}", POINT_PREFIX, timestamp.format("%Y%m%d-%H%M%S-%3f"))
}

/// Ids are file stems; reject anything that could address another path.
fn validate_id(id: &str) -> Result<(), RestoreError> {
    let valid = id.starts_with(POINT_PREFIX)
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RestoreError::PointNotFound { id: id.to_string() })
    }
}

/// Result of a rollback.
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub point: RestorationPoint,
    pub stats: TreeStats,
    pub check: ResultCheck,
}

/// Creates, lists, loads and replays restoration points.
#[derive(Debug, Clone)]
pub struct RestorationPointManager {
    config: RestoreConfig,
}

impl RestorationPointManager {
    pub fn new(config: RestoreConfig) -> Self {
        RestorationPointManager { config }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn archive_path(&self, id: &str) -> PathBuf {
        self.config
            .points_dir
            .join(format!("{}.{}", id, POINT_ARCHIVE_EXT))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.config
            .points_dir
            .join(format!("{}.{}", id, POINT_METADATA_EXT))
    }

    fn id_in_use(&self, id: &str) -> bool {
        let archive = self.archive_path(id);
        let metadata = self.metadata_path(id);
        archive.exists()
            || metadata.exists()
            || fs_ops::partial_path(&archive).exists()
            || fs_ops::partial_path(&metadata).exists()
    }

    fn allocate_id(&self, timestamp: DateTime<Utc>) -> String {
        let base = point_id_for(timestamp);
        if !self.id_in_use(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !self.id_in_use(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Capture `target` into a new restoration point.
    ///
    /// Returns only after both the archive and its metadata are durably on
    /// disk. The archive is re-read and its digest compared with the digest
    /// taken from the directory before the point is published. A missing
    /// target is created empty and captured as such. The point records the
    /// target as an absolute path.
    pub fn checkpoint(&self, target: &Path) -> Result<RestorationPoint, EngineError> {
        fs_ops::ensure_dir(&self.config.points_dir)?;
        fs_ops::ensure_dir(target)?;
        let target = fs_ops::resolve_path(target);
        let target = target.as_path();
        if fs_ops::resolve_path(&self.config.points_dir).starts_with(target) {
            return Err(EngineError::InvalidPath {
                path: target.to_path_buf(),
                reason: format!(
                    "contains the restoration point directory {}",
                    self.config.points_dir.display()
                ),
            });
        }

        let timestamp = Utc::now();
        let id = self.allocate_id(timestamp);
        let archive_path = self.archive_path(&id);
        let metadata_path = self.metadata_path(&id);
        let partial_archive = fs_ops::partial_path(&archive_path);

        let result = (|| -> Result<(ChecksumValue, TreeStats), EngineError> {
            let algorithm = self.config.algorithm;
            let checksum = Manifest::from_directory(target, algorithm)?.digest();

            let stats =
                archive::pack_directory(target, &partial_archive, self.config.compression_level)?;

            let captured = archive::manifest_of_archive(&partial_archive, algorithm)?.digest();
            if captured != checksum {
                return Err(EngineError::archive(
                    &partial_archive,
                    format!(
                        "capture does not match target (target {}, archive {}); was the target modified during capture?",
                        checksum, captured
                    ),
                ));
            }

            fs_ops::publish_partial(&archive_path)?;

            let metadata = PointMetadata {
                timestamp,
                target: target.to_path_buf(),
                checksum: checksum.clone(),
            };
            metadata.write(&metadata_path)?;
            Ok((checksum, stats))
        })();

        match result {
            Ok((checksum, stats)) => {
                info!(
                    point = %id,
                    target = %target.display(),
                    files = stats.files,
                    bytes = stats.bytes,
                    "restoration point created"
                );
                Ok(RestorationPoint {
                    id,
                    timestamp,
                    archive_path,
                    metadata_path,
                    target: target.to_path_buf(),
                    checksum,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&partial_archive);
                if !metadata_path.exists() {
                    let _ = fs::remove_file(&archive_path);
                }
                warn!(target = %target.display(), error = %e, "restoration point capture failed");
                Err(e)
            }
        }
    }

    /// Load a restoration point by id.
    pub fn load(&self, id: &str) -> Result<RestorationPoint, RestoreError> {
        validate_id(id)?;
        let metadata_path = self.metadata_path(id);
        let archive_path = self.archive_path(id);
        if !metadata_path.is_file() || !archive_path.is_file() {
            return Err(RestoreError::PointNotFound { id: id.to_string() });
        }

        let metadata = PointMetadata::read(&metadata_path).map_err(|source| RestoreError::Rollback {
            point: id.to_string(),
            source,
        })?;

        Ok(RestorationPoint {
            id: id.to_string(),
            timestamp: metadata.timestamp,
            archive_path,
            metadata_path,
            target: metadata.target,
            checksum: metadata.checksum,
        })
    }

    /// Lazily enumerate restoration points. Each call starts a fresh scan.
    /// Order follows the directory listing; use `list_sorted` for a stable
    /// order.
    pub fn list(&self) -> Result<RestorationPoints, EngineError> {
        let entries = match fs::read_dir(&self.config.points_dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(EngineError::EnumerationFailed {
                    path: self.config.points_dir.clone(),
                    source: e,
                })
            }
        };
        Ok(RestorationPoints {
            dir: self.config.points_dir.clone(),
            entries,
        })
    }

    /// All readable points, oldest first. Unreadable records are logged and
    /// skipped.
    pub fn list_sorted(&self) -> Result<Vec<PointSummary>, EngineError> {
        let mut points: Vec<PointSummary> = self
            .list()?
            .filter_map(|item| match item {
                Ok(point) => Some(point),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable restoration point");
                    None
                }
            })
            .collect();
        points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(points)
    }

    /// Most recent point recorded for `target`.
    pub fn latest_for_target(&self, target: &Path) -> Result<Option<PointSummary>, EngineError> {
        let wanted = fs_ops::resolve_path(target);
        Ok(self
            .list_sorted()?
            .into_iter()
            .rev()
            .find(|p| p.target.is_absolute() && fs_ops::resolve_path(&p.target) == wanted))
    }

    /// Recompute a point's digest from its archive and compare it with the
    /// digest recorded at capture time.
    pub fn verify_point(&self, id: &str) -> Result<ResultCheck, RestoreError> {
        let point = self.load(id)?;
        let actual = archive::manifest_of_archive(&point.archive_path, point.checksum.algorithm())
            .map_err(|source| RestoreError::Rollback {
                point: id.to_string(),
                source,
            })?
            .digest();
        Ok(ResultCheck {
            expected: point.checksum,
            actual,
        })
    }

    /// Restore a point's target from the point's archive.
    ///
    /// The archive is verified before the target is touched. The target lock
    /// is held for the whole replay.
    pub fn rollback(&self, id: &str) -> Result<RollbackOutcome, RestoreError> {
        let point = self.load(id)?;
        if !point.target.is_absolute() {
            return Err(RestoreError::Rollback {
                point: id.to_string(),
                source: EngineError::InvalidPath {
                    path: point.target.clone(),
                    reason: "recorded target is not an absolute path".to_string(),
                },
            });
        }

        let integrity = self.verify_point(id)?;
        if !integrity.passed() {
            return Err(RestoreError::Rollback {
                point: id.to_string(),
                source: EngineError::archive(
                    &point.archive_path,
                    format!(
                        "archive digest {} does not match recorded {}",
                        integrity.actual, integrity.expected
                    ),
                ),
            });
        }

        let _lock = TargetLock::acquire(&self.config.locks_dir(), &point.target)?;
        info!(point = %id, target = %point.target.display(), "rolling back");

        let rollback_error = |source| RestoreError::Rollback {
            point: id.to_string(),
            source,
        };
        fs_ops::clear_directory(&point.target).map_err(rollback_error)?;
        let stats =
            archive::unpack_into(&point.archive_path, &point.target).map_err(rollback_error)?;

        let check =
            verify::verify_restored(&point.target, &point.checksum).map_err(rollback_error)?;
        if !check.passed() {
            return Err(RestoreError::ResultVerification {
                target: point.target.clone(),
                point: id.to_string(),
                expected: check.expected.to_string_with_algo(),
                actual: check.actual.to_string_with_algo(),
            });
        }

        info!(point = %id, files = stats.files, "rollback complete");
        Ok(RollbackOutcome { point, stats, check })
    }

    /// Roll back `target` to the newest point recorded for it.
    pub fn rollback_latest(&self, target: &Path) -> Result<RollbackOutcome, RestoreError> {
        let latest = self
            .latest_for_target(target)
            .map_err(|source| RestoreError::Rollback {
                point: String::from("<latest>"),
                source,
            })?
            .ok_or_else(|| RestoreError::PointNotFound {
                id: format!("<latest for {}>", target.display()),
            })?;
        self.rollback(&latest.id)
    }
}

/// Lazy, finite iterator over the restoration points in a directory.
pub struct RestorationPoints {
    dir: PathBuf,
    entries: Option<fs::ReadDir>,
}

impl Iterator for RestorationPoints {
    type Item = Result<PointSummary, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        for entry in entries.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(EngineError::EnumerationFailed {
                        path: self.dir.clone(),
                        source: e,
                    }))
                }
            };

            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(PARTIAL_SUFFIX) || !name.starts_with(POINT_PREFIX) {
                continue;
            }
            let Some(id) = name.strip_suffix(&format!(".{}", POINT_METADATA_EXT)) else {
                continue;
            };

            let archive = self.dir.join(format!("{}.{}", id, POINT_ARCHIVE_EXT));
            let summary = PointMetadata::read(&path).map(|metadata| PointSummary {
                id: id.to_string(),
                timestamp: metadata.timestamp,
                target: metadata.target,
                size_on_disk: archive::file_size(&archive) + archive::file_size(&path),
            });
            debug!(point = %id, "listed restoration point");
            return Some(summary);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::checksum_directory;
    use crate::testutil::{self, Fixture};

    #[test]
    fn test_checkpoint_writes_paired_files_and_round_trips() {
        let fx = Fixture::new();
        let target = fx.target(&[("bin/app", "binary"), ("etc/conf", "x=1")]);
        let manager = RestorationPointManager::new(fx.config());

        let point = manager.checkpoint(&target).expect("checkpoint");

        assert!(point.archive_path.is_file());
        assert!(point.metadata_path.is_file());
        assert_eq!(
            point.archive_path.file_stem().unwrap().to_string_lossy(),
            format!("{}.tar", point.id)
        );
        assert_eq!(point.target, fs_ops::resolve_path(&target));
        assert!(point.target.is_absolute());
        assert_eq!(
            point.checksum,
            checksum_directory(&target, point.checksum.algorithm()).unwrap()
        );

        // Re-checksumming the archive reproduces the recorded checksum
        assert!(manager.verify_point(&point.id).unwrap().passed());
    }

    #[test]
    fn test_checkpoint_of_missing_target_captures_empty_tree() {
        let fx = Fixture::new();
        let manager = RestorationPointManager::new(fx.config());
        let target = fx.root.join("fresh");

        let point = manager.checkpoint(&target).expect("checkpoint");
        assert!(target.is_dir());
        assert!(manager.verify_point(&point.id).unwrap().passed());
    }

    #[test]
    fn test_checkpoint_into_unwritable_location_fails_cleanly() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        // points_dir is a regular file, so nothing can be written below it
        fs::write(&fx.points, b"not a directory").unwrap();
        let manager = RestorationPointManager::new(fx.config());

        assert!(manager.checkpoint(&target).is_err());
        assert_eq!(fs::read_to_string(target.join("a")).unwrap(), "1");
    }

    #[test]
    fn test_checkpoint_refuses_target_containing_point_store() {
        let fx = Fixture::new();
        let manager = RestorationPointManager::new(fx.config());
        assert!(matches!(
            manager.checkpoint(&fx.root),
            Err(EngineError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_ids_are_unique_within_the_same_millisecond() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let manager = RestorationPointManager::new(fx.config());

        let ids: Vec<String> = (0..3)
            .map(|_| manager.checkpoint(&target).unwrap().id)
            .collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_list_is_restartable_and_reports_size() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let manager = RestorationPointManager::new(fx.config());
        let first = manager.checkpoint(&target).unwrap();
        let second = manager.checkpoint(&target).unwrap();

        let listed: Vec<PointSummary> = manager.list().unwrap().map(|p| p.unwrap()).collect();
        assert_eq!(listed.len(), 2);
        let resolved = fs_ops::resolve_path(&target);
        assert!(listed
            .iter()
            .all(|p| p.size_on_disk > 0 && p.target == resolved));

        let again = manager.list_sorted().unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].id, first.id);
        assert_eq!(again[1].id, second.id);
    }

    #[test]
    fn test_list_of_missing_directory_is_empty() {
        let fx = Fixture::new();
        let manager = RestorationPointManager::new(fx.config());
        assert_eq!(manager.list().unwrap().count(), 0);
    }

    #[test]
    fn test_load_rejects_path_like_ids() {
        let fx = Fixture::new();
        let manager = RestorationPointManager::new(fx.config());
        assert!(matches!(
            manager.load("../../etc/passwd"),
            Err(RestoreError::PointNotFound { .. })
        ));
        assert!(matches!(
            manager.load("rp-20990101-000000-000"),
            Err(RestoreError::PointNotFound { .. })
        ));
    }

    #[test]
    fn test_rollback_restores_captured_state() {
        let fx = Fixture::new();
        let target = fx.target(&[("keep.txt", "original"), ("dir/nested", "n")]);
        let manager = RestorationPointManager::new(fx.config());
        let point = manager.checkpoint(&target).unwrap();

        fs::write(target.join("keep.txt"), "clobbered").unwrap();
        fs::write(target.join("junk"), "junk").unwrap();

        let outcome = manager.rollback(&point.id).expect("rollback");
        assert!(outcome.check.passed());
        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "original");
        assert!(!target.join("junk").exists());
    }

    #[test]
    fn test_rollback_from_another_directory_restores_recorded_target() {
        let fx = Fixture::new();
        let manager = RestorationPointManager::new(fx.config());
        let first_cwd = fx.tree("cwd-a", &[("build/x", "captured")]);
        let second_cwd = fx.tree("cwd-b", &[("build/precious", "keep")]);

        let point = testutil::in_dir(&first_cwd, || manager.checkpoint(Path::new("build")))
            .expect("checkpoint");
        fs::write(first_cwd.join("build/x"), "changed").unwrap();
        testutil::in_dir(&second_cwd, || manager.rollback(&point.id)).expect("rollback");

        assert_eq!(point.target, fs_ops::resolve_path(&first_cwd.join("build")));
        assert_eq!(manager.load(&point.id).unwrap().target, point.target);
        assert_eq!(fs::read_to_string(second_cwd.join("build/precious")).unwrap(), "keep");
        assert!(!second_cwd.join("build/x").exists());
        assert_eq!(fs::read_to_string(first_cwd.join("build/x")).unwrap(), "captured");
    }

    #[test]
    fn test_rollback_refuses_relative_recorded_target() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let manager = RestorationPointManager::new(fx.config());
        let point = manager.checkpoint(&target).unwrap();

        let mut metadata = PointMetadata::read(&point.metadata_path).unwrap();
        metadata.target = PathBuf::from("build");
        metadata.write(&point.metadata_path).unwrap();

        assert!(matches!(
            manager.rollback(&point.id),
            Err(RestoreError::Rollback { source: EngineError::InvalidPath { .. }, .. })
        ));
        assert_eq!(fs::read_to_string(target.join("a")).unwrap(), "1");
    }

    #[test]
    fn test_rollback_latest_picks_newest_point_for_target() {
        let fx = Fixture::new();
        let target = fx.target(&[("v", "1")]);
        let manager = RestorationPointManager::new(fx.config());
        manager.checkpoint(&target).unwrap();
        fs::write(target.join("v"), "2").unwrap();
        manager.checkpoint(&target).unwrap();
        fs::write(target.join("v"), "3").unwrap();

        manager.rollback_latest(&target).expect("rollback latest");
        assert_eq!(fs::read_to_string(target.join("v")).unwrap(), "2");
    }

    #[test]
    fn test_rollback_refuses_corrupt_archive_without_touching_target() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let manager = RestorationPointManager::new(fx.config());
        let point = manager.checkpoint(&target).unwrap();

        fs::write(target.join("a"), "current").unwrap();
        fs::write(&point.archive_path, b"garbage").unwrap();

        assert!(matches!(
            manager.rollback(&point.id),
            Err(RestoreError::Rollback { .. })
        ));
        assert_eq!(fs::read_to_string(target.join("a")).unwrap(), "current");
    }
}
