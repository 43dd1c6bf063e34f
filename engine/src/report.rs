//! Reporter: summaries of restore operations.
//!
//! A report names the backup, the target, the backup type, how many files and
//! bytes ended up in the target and whether the post-restore comparison
//! passed. Reports are rendered as text and, when a reports directory is
//! configured, written as `report-<operation-id>.json`.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RestoreConfig;
use crate::error::{EngineError, RestoreError};
use crate::fs_ops;
use crate::model::{RestoreOperation, RestoreStatus, VerificationOutcome};
use crate::verify;

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Structured summary of a restore, or of a target inspected against a
/// backup outside a live restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub operation_id: Uuid,
    pub backup: PathBuf,
    pub target: PathBuf,
    pub backup_type: Option<String>,
    /// None for inspection reports
    pub status: Option<RestoreStatus>,
    pub files: u64,
    pub bytes: u64,
    pub verification: VerificationOutcome,
    pub expected_checksum: Option<String>,
    pub actual_checksum: Option<String>,
    pub restoration_point: Option<String>,
    pub failed_stage: Option<RestoreStatus>,
    pub error: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl RestoreReport {
    pub fn from_operation(operation: &RestoreOperation) -> Self {
        RestoreReport {
            operation_id: operation.id,
            backup: operation.backup_path.clone(),
            target: operation.target_dir.clone(),
            backup_type: operation.backup_type.as_ref().map(|t| t.to_string()),
            status: Some(operation.status),
            files: operation.files_restored,
            bytes: operation.bytes_restored,
            verification: operation.verification,
            expected_checksum: operation.expected_checksum.clone(),
            actual_checksum: operation.actual_checksum.clone(),
            restoration_point: operation.restoration_point.clone(),
            failed_stage: operation.failed_stage,
            error: operation.error.clone(),
            generated_at: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.verification == VerificationOutcome::Passed
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dash = "-".to_string();
        writeln!(f, "Restore report {}", self.operation_id)?;
        writeln!(f, "  Backup:        {}", self.backup.display())?;
        writeln!(f, "  Target:        {}", self.target.display())?;
        writeln!(f, "  Type:          {}", self.backup_type.as_ref().unwrap_or(&dash))?;
        match self.status {
            Some(status) => writeln!(f, "  Status:        {}", status)?,
            None => writeln!(f, "  Status:        inspection")?,
        }
        writeln!(f, "  Files:         {}", self.files)?;
        writeln!(f, "  Size:          {} ({} bytes)", format_bytes(self.bytes), self.bytes)?;
        writeln!(f, "  Verification:  {}", self.verification)?;
        if let Some(expected) = &self.expected_checksum {
            writeln!(f, "  Expected:      {}", expected)?;
        }
        if let Some(actual) = &self.actual_checksum {
            writeln!(f, "  Actual:        {}", actual)?;
        }
        if let Some(point) = &self.restoration_point {
            writeln!(f, "  Restore point: {}", point)?;
        }
        if let Some(stage) = self.failed_stage {
            writeln!(f, "  Failed stage:  {}", stage)?;
        }
        if let Some(error) = &self.error {
            writeln!(f, "  Error:         {}", error)?;
        }
        Ok(())
    }
}

/// Builds reports and writes their JSON artifacts.
#[derive(Debug, Clone)]
pub struct Reporter {
    reports_dir: Option<PathBuf>,
}

impl Reporter {
    pub fn new(config: &RestoreConfig) -> Self {
        Reporter {
            reports_dir: config.reports_dir.clone(),
        }
    }

    pub fn artifact_path(&self, operation_id: Uuid) -> Option<PathBuf> {
        self.reports_dir
            .as_ref()
            .map(|dir| dir.join(format!("report-{}.json", operation_id)))
    }

    /// Write the report's JSON artifact. Returns its path, or None when no
    /// reports directory is configured.
    pub fn write_artifact(&self, report: &RestoreReport) -> Result<Option<PathBuf>, EngineError> {
        let Some(path) = self.artifact_path(report.operation_id) else {
            return Ok(None);
        };
        let json = report.to_json().map_err(|e| EngineError::WriteError {
            path: path.clone(),
            source: e.into(),
        })?;
        fs_ops::write_file_durable(&path, json.as_bytes())?;
        debug!(report = %path.display(), "wrote report artifact");
        Ok(Some(path))
    }

    /// Summarize a completed operation and write its artifact.
    pub fn emit(&self, operation: &RestoreOperation) -> Result<RestoreReport, EngineError> {
        let report = RestoreReport::from_operation(operation);
        self.write_artifact(&report)?;
        Ok(report)
    }

    /// Compare `target` with what `backup` restores to, without restoring.
    ///
    /// Reads the backup's metadata and digests the target with the backup's
    /// algorithm. Neither directory is modified. A missing target reports
    /// zero files and a failed comparison.
    pub fn inspect(&self, backup: &Path, target: &Path) -> Result<RestoreReport, RestoreError> {
        let opened = verify::open_backup(backup)?;
        let expected = &opened.metadata.checksum;

        let (files, bytes, actual) = if target.is_dir() {
            let inspect_error = |e: EngineError| RestoreError::InvalidTarget {
                target: target.to_path_buf(),
                reason: e.to_string(),
            };
            let stats = fs_ops::tree_stats(target).map_err(inspect_error)?;
            let check = verify::verify_restored(target, expected).map_err(inspect_error)?;
            (stats.files, stats.bytes, Some(check.actual))
        } else {
            (0, 0, None)
        };

        let verification = match &actual {
            Some(actual) if actual == expected => VerificationOutcome::Passed,
            _ => VerificationOutcome::Failed,
        };

        let report = RestoreReport {
            operation_id: Uuid::new_v4(),
            backup: backup.to_path_buf(),
            target: target.to_path_buf(),
            backup_type: Some(opened.backup_type().to_string()),
            status: None,
            files,
            bytes,
            verification,
            expected_checksum: Some(expected.to_string_with_algo()),
            actual_checksum: actual.map(|a| a.to_string_with_algo()),
            restoration_point: None,
            failed_stage: None,
            error: None,
            generated_at: Utc::now(),
        };

        self.write_artifact(&report).map_err(|e| RestoreError::InvalidTarget {
            target: target.to_path_buf(),
            reason: format!("could not write report: {}", e),
        })?;
        info!(
            backup = %backup.display(),
            target = %target.display(),
            verification = %report.verification,
            "inspection report generated"
        );
        Ok(report)
    }
}
