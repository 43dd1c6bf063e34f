//! Restore engine.
//!
//! Runs one restore as a strict pipeline:
//!
//! ```text
//! pending -> verifying -> checkpointing -> applying -> verifying-result -> succeeded
//!                 \              \              \               \
//!                  +--------------+--------------+---------------+-> failed
//! ```
//!
//! The pipeline halts at the first failing stage. Nothing in the target is
//! touched before `applying`, and `applying` is never entered without a
//! durable restoration point. A failed result verification is reported, not
//! rolled back; rollback is a separate call on the point manager.
//!
//! Cancelling (killing the process) before `applying` is safe. During
//! `applying` the target is left in an undefined state recoverable only from
//! the restoration point named in the error.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::archive;
use crate::config::RestoreConfig;
use crate::error::{EngineError, RestoreError};
use crate::fs_ops::{self, TreeStats};
use crate::lock::TargetLock;
use crate::model::{BackupType, RestoreOperation, RestoreStatus, VerificationOutcome};
use crate::points::RestorationPointManager;
use crate::progress::RestoreObserver;
use crate::report::Reporter;
use crate::verify::{self, VerifiedBackup};

/// What the applying stage does, fixed once the backup is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestorePlan {
    /// Clear, then extract the archive
    Full { archive: PathBuf },
    /// Clear, extract the parent's archive, then the delta on top
    Incremental { parent: PathBuf, delta: PathBuf },
    /// Clear, then copy the capture preserving attributes
    Snapshot { data: PathBuf },
}

impl RestorePlan {
    pub fn for_backup(verified: &VerifiedBackup) -> Result<Self, RestoreError> {
        let backup = &verified.backup;
        match (backup.backup_type(), &verified.parent) {
            (BackupType::Full, _) => Ok(RestorePlan::Full {
                archive: backup.archive_path(),
            }),
            (BackupType::Incremental, Some(parent)) => Ok(RestorePlan::Incremental {
                parent: parent.archive_path(),
                delta: backup.archive_path(),
            }),
            (BackupType::Incremental, None) => Err(RestoreError::MissingDependency {
                backup: backup.path.clone(),
                parent: backup.parent_path(),
                reason: "no verified full parent".to_string(),
            }),
            (BackupType::Snapshot, _) => Ok(RestorePlan::Snapshot {
                data: backup.snapshot_dir(),
            }),
            (BackupType::Unsupported(name), _) => Err(RestoreError::UnsupportedType {
                backup: backup.path.clone(),
                type_name: name.clone(),
            }),
        }
    }

    /// Replace the contents of `target` with the backup's tree.
    pub fn apply(&self, target: &Path) -> Result<(), EngineError> {
        fs_ops::clear_directory(target)?;
        match self {
            RestorePlan::Full { archive } => {
                archive::unpack_into(archive, target)?;
            }
            RestorePlan::Incremental { parent, delta } => {
                // Parent first; the delta overwrites what changed since
                archive::unpack_into(parent, target)?;
                archive::unpack_into(delta, target)?;
            }
            RestorePlan::Snapshot { data } => {
                fs_ops::copy_tree_preserving(data, target)?;
            }
        }
        Ok(())
    }
}

/// Drives restore operations.
#[derive(Debug, Clone)]
pub struct RestoreEngine {
    config: RestoreConfig,
    points: RestorationPointManager,
    reporter: Reporter,
}

impl RestoreEngine {
    pub fn new(config: RestoreConfig) -> Self {
        RestoreEngine {
            points: RestorationPointManager::new(config.clone()),
            reporter: Reporter::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &RestoreConfig {
        &self.config
    }

    pub fn points(&self) -> &RestorationPointManager {
        &self.points
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Restore `backup` into `target`, emit the report and return the
    /// finished operation. `exit_code()` on the result gives 0 or 1.
    pub fn restore(&self, backup: &Path, target: &Path) -> RestoreOperation {
        let mut operation = RestoreOperation::new(backup, target);
        let _ = self.run(&mut operation, None);
        if let Err(e) = self.reporter.emit(&operation) {
            warn!(operation = %operation.id, error = %e, "failed to write restore report");
        }
        operation
    }

    /// Run a pending operation through the pipeline.
    ///
    /// On return the operation is terminal: `succeeded`, or `failed` with
    /// `failed_stage` and `error` set. The returned error is the one that
    /// stopped the pipeline.
    pub fn run(
        &self,
        operation: &mut RestoreOperation,
        observer: Option<&dyn RestoreObserver>,
    ) -> Result<(), RestoreError> {
        if operation.status != RestoreStatus::Pending {
            return Err(RestoreError::InvalidTarget {
                target: operation.target_dir.clone(),
                reason: format!("operation {} is {}, not pending", operation.id, operation.status),
            });
        }

        info!(
            operation = %operation.id,
            backup = %operation.backup_path.display(),
            target = %operation.target_dir.display(),
            "restore started"
        );
        let result = self.pipeline(operation, observer);

        match &result {
            Ok(()) => {
                enter(operation, RestoreStatus::Succeeded, observer);
                info!(
                    operation = %operation.id,
                    files = operation.files_restored,
                    bytes = operation.bytes_restored,
                    "restore succeeded"
                );
            }
            Err(e) => {
                operation.failed_stage = Some(operation.status);
                operation.error = Some(e.to_string());
                enter(operation, RestoreStatus::Failed, observer);
                error!(
                    operation = %operation.id,
                    stage = %e.stage(),
                    point = operation.restoration_point.as_deref().unwrap_or("-"),
                    error = %e,
                    "restore failed"
                );
            }
        }

        operation.finished_at = Some(Utc::now());
        if let Some(observer) = observer {
            observer.on_completed(operation);
        }
        result
    }

    fn pipeline(
        &self,
        operation: &mut RestoreOperation,
        observer: Option<&dyn RestoreObserver>,
    ) -> Result<(), RestoreError> {
        let target = fs_ops::resolve_path(&operation.target_dir);

        enter(operation, RestoreStatus::Verifying, observer);
        let verified = verify::verify_backup(&operation.backup_path)?;
        let expected = verified.backup.metadata.checksum.clone();
        operation.backup_type = Some(verified.backup.backup_type().clone());
        operation.expected_checksum = Some(expected.to_string_with_algo());
        let plan = RestorePlan::for_backup(&verified)?;
        self.check_target(&target, &verified)?;

        enter(operation, RestoreStatus::Checkpointing, observer);
        let _lock = TargetLock::acquire(&self.config.locks_dir(), &target)?;
        let point = self
            .points
            .checkpoint(&target)
            .map_err(|source| RestoreError::Checkpoint {
                target: target.clone(),
                source,
            })?;
        operation.restoration_point = Some(point.id.clone());

        enter(operation, RestoreStatus::Applying, observer);
        let apply_error = |source| RestoreError::Apply {
            target: target.clone(),
            point: point.id.clone(),
            source,
        };
        plan.apply(&target).map_err(apply_error)?;
        let stats: TreeStats = fs_ops::tree_stats(&target).map_err(apply_error)?;
        operation.files_restored = stats.files;
        operation.bytes_restored = stats.bytes;

        enter(operation, RestoreStatus::VerifyingResult, observer);
        let check = verify::verify_restored(&target, &expected).map_err(|e| {
            RestoreError::ResultVerification {
                target: target.clone(),
                point: point.id.clone(),
                expected: expected.to_string_with_algo(),
                actual: format!("<unreadable: {}>", e),
            }
        })?;
        operation.actual_checksum = Some(check.actual.to_string_with_algo());

        if !check.passed() {
            operation.verification = VerificationOutcome::Failed;
            return Err(RestoreError::ResultVerification {
                target,
                point: point.id,
                expected: check.expected.to_string_with_algo(),
                actual: check.actual.to_string_with_algo(),
            });
        }
        operation.verification = VerificationOutcome::Passed;
        Ok(())
    }

    /// Refuse targets whose clearing would destroy the backup or the
    /// restoration point store.
    fn check_target(&self, target: &Path, verified: &VerifiedBackup) -> Result<(), RestoreError> {
        let invalid = |reason: String| RestoreError::InvalidTarget {
            target: target.to_path_buf(),
            reason,
        };

        if target.exists() && !target.is_dir() {
            return Err(invalid("exists and is not a directory".to_string()));
        }

        let resolved = fs_ops::resolve_path(target);
        let backups = std::iter::once(&verified.backup).chain(verified.parent.as_ref());
        for backup in backups {
            if fs_ops::paths_overlap(&resolved, &fs_ops::resolve_path(&backup.path)) {
                return Err(invalid(format!("overlaps backup {}", backup.path.display())));
            }
        }

        if fs_ops::paths_overlap(&resolved, &fs_ops::resolve_path(&self.config.points_dir)) {
            return Err(invalid(format!(
                "overlaps restoration point directory {}",
                self.config.points_dir.display()
            )));
        }
        Ok(())
    }
}

fn enter(
    operation: &mut RestoreOperation,
    stage: RestoreStatus,
    observer: Option<&dyn RestoreObserver>,
) {
    debug_assert!(
        operation.status.can_transition_to(stage),
        "illegal transition {} -> {}",
        operation.status,
        stage
    );
    info!(operation = %operation.id, from = %operation.status, to = %stage, "restore stage");
    operation.status = stage;
    if let Some(observer) = observer {
        observer.on_stage(operation, stage);
    }
}
