//! Core data model for restore operations.
//!
//! - Backup: an immutable, externally produced recovery artifact
//! - RestorationPoint: a capture of a target taken before a restore mutates it
//! - RestoreOperation: the transient state of one restore invocation
//! - BackupType, RestoreStatus, VerificationOutcome: enums controlling behavior

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::ChecksumValue;
use crate::metadata::BackupMetadata;

/// File name of a backup's metadata record.
pub const BACKUP_METADATA_FILE: &str = "backup.meta";

/// File name of a full or incremental backup's archive.
pub const BACKUP_ARCHIVE_FILE: &str = "backup.tar.gz";

/// Directory holding a snapshot backup's live capture.
pub const SNAPSHOT_DATA_DIR: &str = "data";

/// Declared type of a backup; selects the restore strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum BackupType {
    /// Self-sufficient archive of the whole tree
    Full,
    /// Delta archive applied on top of a full parent
    Incremental,
    /// Uncompressed directory capture
    Snapshot,
    /// Anything else a producer wrote; never restorable
    Unsupported(String),
}

impl BackupType {
    /// Parse a TYPE value. Unknown values are kept, not rejected, so the
    /// restore engine can report them as unsupported.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "full" => Self::Full,
            "incremental" => Self::Incremental,
            "snapshot" => Self::Snapshot,
            _ => Self::Unsupported(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Snapshot => "snapshot",
            Self::Unsupported(name) => name,
        }
    }
}

impl From<String> for BackupType {
    fn from(s: String) -> Self {
        BackupType::parse(&s)
    }
}

impl From<BackupType> for String {
    fn from(t: BackupType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backup opened from disk. Read-only input: nothing in this crate writes
/// to or deletes a backup.
#[derive(Debug, Clone)]
pub struct Backup {
    /// Backup directory
    pub path: PathBuf,

    /// Parsed `backup.meta`
    pub metadata: BackupMetadata,
}

impl Backup {
    pub fn backup_type(&self) -> &BackupType {
        &self.metadata.backup_type
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(BACKUP_METADATA_FILE)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.path.join(BACKUP_ARCHIVE_FILE)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.path.join(SNAPSHOT_DATA_DIR)
    }

    /// Resolve the PARENT reference of an incremental backup. Relative
    /// references are taken relative to the directory containing this backup.
    pub fn parent_path(&self) -> Option<PathBuf> {
        let parent = self.metadata.parent.as_ref()?;
        if parent.is_absolute() {
            return Some(parent.clone());
        }
        let base = self.path.parent().unwrap_or_else(|| Path::new(""));
        Some(base.join(parent))
    }

    /// Short name used in logs and reports.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A capture of a target directory taken before a restore mutated it.
#[derive(Debug, Clone, Serialize)]
pub struct RestorationPoint {
    /// Unique id, derived from the creation timestamp
    pub id: String,

    /// When the point was captured
    pub timestamp: DateTime<Utc>,

    /// Compressed capture of the target
    pub archive_path: PathBuf,

    /// Paired metadata record
    pub metadata_path: PathBuf,

    /// Directory the point restores into
    pub target: PathBuf,

    /// Digest of the target at capture time
    #[serde(serialize_with = "serialize_checksum")]
    pub checksum: ChecksumValue,
}

fn serialize_checksum<S: serde::Serializer>(
    value: &ChecksumValue,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string_with_algo())
}

/// One entry of a restoration point listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub target: PathBuf,
    /// Archive plus metadata, in bytes
    pub size_on_disk: u64,
}

/// The state of a restore operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStatus {
    /// Created, not yet started
    Pending,
    /// Backup integrity gate
    Verifying,
    /// Capturing the target into a restoration point
    Checkpointing,
    /// Clearing the target and applying the backup
    Applying,
    /// Comparing the restored tree with the backup's checksum
    VerifyingResult,
    /// Restored and verified
    Succeeded,
    /// Stopped at the first failing stage
    Failed,
}

impl RestoreStatus {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestoreStatus::Succeeded | RestoreStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RestoreStatus) -> bool {
        use RestoreStatus::*;
        matches!(
            (self, next),
            (Pending, Verifying)
                | (Verifying, Checkpointing)
                | (Checkpointing, Applying)
                | (Applying, VerifyingResult)
                | (VerifyingResult, Succeeded)
        ) || (!self.is_terminal() && next == Failed)
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreStatus::Pending => "pending",
            RestoreStatus::Verifying => "verifying",
            RestoreStatus::Checkpointing => "checkpointing",
            RestoreStatus::Applying => "applying",
            RestoreStatus::VerifyingResult => "verifying-result",
            RestoreStatus::Succeeded => "succeeded",
            RestoreStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of comparing a tree against a recorded checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationOutcome {
    Passed,
    Failed,
    NotRun,
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationOutcome::Passed => write!(f, "passed"),
            VerificationOutcome::Failed => write!(f, "failed"),
            VerificationOutcome::NotRun => write!(f, "not run"),
        }
    }
}

/// Transient state of a single restore invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOperation {
    /// Unique identifier for this operation
    pub id: Uuid,

    /// Backup directory being restored
    pub backup_path: PathBuf,

    /// Directory being restored into
    pub target_dir: PathBuf,

    /// Declared type, once the backup metadata has been read
    pub backup_type: Option<BackupType>,

    /// Restoration point captured before mutation
    pub restoration_point: Option<String>,

    /// Current state
    pub status: RestoreStatus,

    /// Files present in the target after applying
    pub files_restored: u64,

    /// Bytes present in the target after applying
    pub bytes_restored: u64,

    /// Result of the post-restore comparison
    pub verification: VerificationOutcome,

    /// Checksum recorded in the backup metadata
    pub expected_checksum: Option<String>,

    /// Checksum of the target after restore
    pub actual_checksum: Option<String>,

    /// Human-readable failure, if any
    pub error: Option<String>,

    /// Stage at which the operation failed
    pub failed_stage: Option<RestoreStatus>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RestoreOperation {
    pub fn new(backup_path: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        RestoreOperation {
            id: Uuid::new_v4(),
            backup_path: backup_path.into(),
            target_dir: target_dir.into(),
            backup_type: None,
            restoration_point: None,
            status: RestoreStatus::Pending,
            files_restored: 0,
            bytes_restored: 0,
            verification: VerificationOutcome::NotRun,
            expected_checksum: None,
            actual_checksum: None,
            error: None,
            failed_stage: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RestoreStatus::Succeeded
    }

    /// CLI-style status code: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}
