//! Error types for the restore engine.
//!
//! Two layers:
//! - `EngineError`: low-level filesystem, archive and metadata failures. Every
//!   variant carries the path it concerns.
//! - `RestoreError`: stage-level failures of a restore or rollback. These are
//!   what callers see; each one names the stage that failed and, once a
//!   restoration point exists, the point id usable for rollback.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::RestoreStatus;

/// Low-level errors raised by filesystem, archive and metadata operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Failed to read from a file
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to a file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to enumerate a directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// Failed to remove a file or directory
    #[error("Failed to remove: {}", path.display())]
    RemoveFailed { path: PathBuf, source: io::Error },

    /// Archive could not be created, read or extracted
    #[error("Archive error in {}: {message}", path.display())]
    Archive {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// A metadata line was not of the form KEY=value
    #[error("Malformed metadata in {} at line {line}: {content:?}", path.display())]
    MalformedMetadata {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// A metadata key required by the record type is absent or empty
    #[error("Metadata {} is missing required key {key}", path.display())]
    MissingMetadataKey { path: PathBuf, key: &'static str },

    /// A metadata value could not be interpreted
    #[error("Metadata {} has invalid {key}: {reason}", path.display())]
    InvalidMetadataValue {
        path: PathBuf,
        key: &'static str,
        reason: String,
    },

    /// Path is unusable for the requested operation
    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::RemoveFailed { source, .. } => source.raw_os_error(),
            Self::Archive {
                source: Some(source),
                ..
            } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn archive_io(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Stage-level failures of a restore or rollback.
///
/// Verification and checkpoint stage errors (`Verification`,
/// `UnsupportedType`, `MissingDependency`, `InvalidTarget`, `TargetLocked`,
/// `Checkpoint`) are raised before the target is touched. `Apply` and
/// `ResultVerification` are raised after the target was cleared; both carry
/// the id of the restoration point that captured the target beforehand.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// Backup checksum mismatch, or missing/corrupt backup metadata
    #[error("verification failed for backup {}: {reason}", backup.display())]
    Verification { backup: PathBuf, reason: String },

    /// Declared backup type is not full, incremental or snapshot
    #[error("unsupported backup type {type_name:?} in backup {}", backup.display())]
    UnsupportedType { backup: PathBuf, type_name: String },

    /// Incremental backup without a usable full parent
    #[error("missing dependency for incremental backup {}: {reason}", backup.display())]
    MissingDependency {
        backup: PathBuf,
        parent: Option<PathBuf>,
        reason: String,
    },

    /// Target overlaps the backup or the restoration point store
    #[error("invalid restore target {}: {reason}", target.display())]
    InvalidTarget { target: PathBuf, reason: String },

    /// Another restore holds the target's lock
    #[error("target {} is locked by another restore", target.display())]
    TargetLocked { target: PathBuf },

    /// Restoration point could not be captured; target untouched
    #[error("checkpoint failed for target {}: {source}", target.display())]
    Checkpoint {
        target: PathBuf,
        #[source]
        source: EngineError,
    },

    /// Extraction or copy into the target failed partway
    #[error(
        "apply failed for target {}: {source} (roll back with restoration point {point})",
        target.display()
    )]
    Apply {
        target: PathBuf,
        point: String,
        #[source]
        source: EngineError,
    },

    /// Restored tree does not match the backup's recorded checksum
    #[error(
        "result verification failed for target {}: expected {expected}, found {actual} (roll back with restoration point {point})",
        target.display()
    )]
    ResultVerification {
        target: PathBuf,
        point: String,
        expected: String,
        actual: String,
    },

    /// No restoration point with this id, or none recorded for the target
    #[error("restoration point not found: {id}")]
    PointNotFound { id: String },

    /// Rollback from a restoration point failed
    #[error("rollback from restoration point {point} failed: {source}")]
    Rollback {
        point: String,
        #[source]
        source: EngineError,
    },
}

impl RestoreError {
    /// The restore stage during which this error was raised.
    pub fn stage(&self) -> RestoreStatus {
        match self {
            Self::Verification { .. }
            | Self::UnsupportedType { .. }
            | Self::MissingDependency { .. }
            | Self::InvalidTarget { .. } => RestoreStatus::Verifying,
            Self::TargetLocked { .. } | Self::Checkpoint { .. } => RestoreStatus::Checkpointing,
            Self::Apply { .. } | Self::PointNotFound { .. } | Self::Rollback { .. } => {
                RestoreStatus::Applying
            }
            Self::ResultVerification { .. } => RestoreStatus::VerifyingResult,
        }
    }

    /// Id of the restoration point usable to undo a partial restore.
    pub fn restoration_point(&self) -> Option<&str> {
        match self {
            Self::Apply { point, .. } | Self::ResultVerification { point, .. } => Some(point),
            _ => None,
        }
    }

    /// True when the target was mutated before the failure.
    pub fn target_mutated(&self) -> bool {
        self.restoration_point().is_some()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
pub type RestoreResult<T> = Result<T, RestoreError>;
