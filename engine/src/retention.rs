//! Retention manager: prunes restoration points past a maximum age.
//!
//! A point is two files. Pruning first moves both into a staging directory
//! inside the point store (`.trash`) by rename; if the second rename fails the
//! first is moved back, so a point is either fully present or fully gone from
//! the store. Staged files are then deleted. Leftovers in the staging
//! directory from an interrupted prune are swept on the next run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RestoreConfig;
use crate::error::EngineError;
use crate::fs_ops::{self, PARTIAL_SUFFIX};
use crate::lock::{lock_path_for, TargetLock};
use crate::model::PointSummary;
use crate::points::{RestorationPointManager, POINT_ARCHIVE_EXT};

/// A point that could not be removed. Both of its files are still in place.
#[derive(Debug, Clone, Serialize)]
pub struct PruneFailure {
    pub point: PointSummary,
    pub reason: String,
}

/// Outcome of a prune.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneSummary {
    pub removed: Vec<PointSummary>,
    pub kept: Vec<PointSummary>,
    pub failed: Vec<PruneFailure>,
    /// Archives without metadata and abandoned `.partial` files removed
    pub orphans_removed: Vec<PathBuf>,
}

impl PruneSummary {
    pub fn bytes_freed(&self) -> u64 {
        self.removed.iter().map(|p| p.size_on_disk).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RetentionManager {
    config: RestoreConfig,
    points: RestorationPointManager,
}

impl RetentionManager {
    pub fn new(config: RestoreConfig) -> Self {
        RetentionManager {
            points: RestorationPointManager::new(config.clone()),
            config,
        }
    }

    /// Remove every point older than `max_age_days` days.
    pub fn prune(&self, max_age_days: u32) -> Result<PruneSummary, EngineError> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        self.prune_older_than(cutoff)
    }

    /// Remove every point whose timestamp is strictly before `cutoff`.
    ///
    /// Points whose target is currently locked by a restore are kept.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneSummary, EngineError> {
        let mut summary = PruneSummary::default();
        if !self.config.points_dir.is_dir() {
            return Ok(summary);
        }

        self.sweep_trash();

        for point in self.points.list_sorted()? {
            if point.timestamp >= cutoff {
                summary.kept.push(point);
                continue;
            }

            if self.target_busy(&point.target) {
                debug!(point = %point.id, "target locked by a restore, keeping point");
                summary.kept.push(point);
                continue;
            }

            match self.remove_point(&point.id) {
                Ok(()) => {
                    info!(
                        point = %point.id,
                        timestamp = %point.timestamp,
                        "pruned restoration point"
                    );
                    summary.removed.push(point);
                }
                Err(e) => {
                    warn!(point = %point.id, error = %e, "could not prune restoration point");
                    summary.failed.push(PruneFailure {
                        point,
                        reason: e.to_string(),
                    });
                }
            }
        }

        summary.orphans_removed = self.remove_orphans(cutoff)?;

        info!(
            removed = summary.removed.len(),
            kept = summary.kept.len(),
            failed = summary.failed.len(),
            orphans = summary.orphans_removed.len(),
            "prune complete"
        );
        Ok(summary)
    }

    fn target_busy(&self, target: &Path) -> bool {
        if !lock_path_for(&self.config.locks_dir(), target).exists() {
            return false;
        }
        match TargetLock::acquire(&self.config.locks_dir(), target) {
            Ok(_lock) => false,
            Err(_) => true,
        }
    }

    /// Move both halves of a point out of the store, then delete them.
    fn remove_point(&self, id: &str) -> Result<(), EngineError> {
        let trash = self.config.trash_dir();
        fs_ops::ensure_dir(&trash)?;

        let metadata = self.points.metadata_path(id);
        let archive = self.points.archive_path(id);
        let staged_metadata = trash.join(file_name(&metadata));
        let staged_archive = trash.join(file_name(&archive));

        // Metadata first: once it is gone the point is no longer listed
        rename(&metadata, &staged_metadata)?;
        if let Err(e) = rename(&archive, &staged_archive) {
            if let Err(restore_err) = rename(&staged_metadata, &metadata) {
                warn!(point = %id, error = %restore_err, "could not return metadata to the store");
            }
            return Err(e);
        }
        fs_ops::sync_dir(&self.config.points_dir)?;

        for staged in [&staged_archive, &staged_metadata] {
            if let Err(e) = fs::remove_file(staged) {
                warn!(path = %staged.display(), error = %e, "staged file left for the next prune");
            }
        }
        Ok(())
    }

    fn sweep_trash(&self) {
        let Ok(entries) = fs::read_dir(self.config.trash_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not empty staged file");
            }
        }
    }

    /// Remove archives that lost their metadata (a capture interrupted
    /// between publishing the archive and the metadata) and abandoned
    /// `.partial` files, when they were last written before `cutoff`.
    fn remove_orphans(&self, cutoff: DateTime<Utc>) -> Result<Vec<PathBuf>, EngineError> {
        let dir = &self.config.points_dir;
        let entries = fs::read_dir(dir).map_err(|e| EngineError::EnumerationFailed {
            path: dir.clone(),
            source: e,
        })?;

        let mut removed = Vec::new();
        let archive_suffix = format!(".{}", POINT_ARCHIVE_EXT);
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();

            let orphaned = if name.ends_with(PARTIAL_SUFFIX) {
                true
            } else if let Some(id) = name.strip_suffix(&archive_suffix) {
                !self.points.metadata_path(id).exists()
            } else {
                false
            };
            if !orphaned || modified_at(&path).map_or(true, |t| t >= cutoff) {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    warn!(path = %path.display(), "removed orphaned restoration point file");
                    removed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not remove orphaned file")
                }
            }
        }
        Ok(removed)
    }
}

fn file_name(path: &Path) -> PathBuf {
    path.file_name().map(PathBuf::from).unwrap_or_default()
}

fn rename(from: &Path, to: &Path) -> Result<(), EngineError> {
    fs::rename(from, to).map_err(|e| EngineError::RemoveFailed {
        path: from.to_path_buf(),
        source: e,
    })
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PointMetadata;
    use crate::testutil::Fixture;

    /// Rewrite a point's TIMESTAMP to `age_days` in the past.
    fn age_point(manager: &RestorationPointManager, id: &str, age_days: i64) {
        let path = manager.metadata_path(id);
        let mut metadata = PointMetadata::read(&path).unwrap();
        metadata.timestamp = Utc::now() - Duration::days(age_days);
        metadata.write(&path).unwrap();
    }

    #[test]
    fn test_prune_removes_old_points_and_keeps_recent_ones() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let config = fx.config();
        let points = RestorationPointManager::new(config.clone());
        let old = points.checkpoint(&target).unwrap();
        let recent = points.checkpoint(&target).unwrap();
        age_point(&points, &old.id, 10);
        age_point(&points, &recent.id, 1);

        let summary = RetentionManager::new(config).prune(7).unwrap();

        assert_eq!(summary.removed.len(), 1);
        assert_eq!(summary.removed[0].id, old.id);
        assert_eq!(summary.kept.len(), 1);
        assert!(summary.is_clean());
        assert!(summary.bytes_freed() > 0);
        assert!(!old.archive_path.exists());
        assert!(!old.metadata_path.exists());
        assert!(recent.archive_path.exists());
        assert!(recent.metadata_path.exists());
    }

    #[test]
    fn test_prune_with_missing_store_is_a_no_op() {
        let fx = Fixture::new();
        let summary = RetentionManager::new(fx.config()).prune(0).unwrap();
        assert!(summary.removed.is_empty() && summary.kept.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_archive_move_keeps_both_halves() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let config = fx.config();
        let points = RestorationPointManager::new(config.clone());
        let point = points.checkpoint(&target).unwrap();
        age_point(&points, &point.id, 30);

        // A directory in the staging area where the archive would go makes
        // the second rename fail
        let staged_archive = config.trash_dir().join(file_name(&point.archive_path));
        fs::create_dir_all(staged_archive.join("occupied")).unwrap();
        let manager = RetentionManager {
            points: points.clone(),
            config: config.clone(),
        };

        // Bypass the sweep so the blocker survives
        let err = manager.remove_point(&point.id).unwrap_err();
        assert!(matches!(err, EngineError::RemoveFailed { .. }));
        assert!(point.archive_path.exists());
        assert!(point.metadata_path.exists());
        assert_eq!(points.list().unwrap().count(), 1);
    }

    #[test]
    fn test_prune_keeps_points_of_locked_targets() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let config = fx.config();
        let points = RestorationPointManager::new(config.clone());
        let point = points.checkpoint(&target).unwrap();
        age_point(&points, &point.id, 30);

        let _held = TargetLock::acquire(&config.locks_dir(), &target).unwrap();
        let summary = RetentionManager::new(config).prune(1).unwrap();

        assert!(summary.removed.is_empty());
        assert_eq!(summary.kept.len(), 1);
        assert!(point.archive_path.exists());
    }

    #[test]
    fn test_prune_removes_old_orphaned_archives() {
        let fx = Fixture::new();
        let target = fx.target(&[("a", "1")]);
        let config = fx.config();
        let points = RestorationPointManager::new(config.clone());
        let point = points.checkpoint(&target).unwrap();
        fs::remove_file(&point.metadata_path).unwrap();
        let stale = filetime::FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(&point.archive_path, stale).unwrap();

        let summary = RetentionManager::new(config).prune(7).unwrap();
        assert_eq!(summary.orphans_removed, vec![point.archive_path.clone()]);
        assert!(!point.archive_path.exists());
    }

    #[test]
    fn test_sweep_empties_staging_area() {
        let fx = Fixture::new();
        let config = fx.config();
        fs::create_dir_all(config.trash_dir()).unwrap();
        fs::write(config.trash_dir().join("rp-left.meta"), b"x").unwrap();

        RetentionManager::new(config.clone()).prune(7).unwrap();
        assert_eq!(fs::read_dir(config.trash_dir()).unwrap().count(), 0);
    }
}
