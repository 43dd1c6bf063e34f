//! # Restore Engine - Backup Restore Library
//!
//! A headless engine for restoring build target directories from verified
//! backups, with a safety checkpoint taken before every destructive step.
//! Designed as the foundation for multiple front-ends (CLI, automation).
//!
//! ## Overview
//!
//! The engine restores three kinds of backup into a target directory:
//! - **full**: one gzip-compressed tar archive of the whole tree
//! - **incremental**: a delta archive applied on top of its full parent
//! - **snapshot**: a plain directory capture, copied with attributes
//!
//! Every restore runs the same pipeline: verify the backup against its
//! recorded checksum, capture the target into a restoration point, clear and
//! apply, then verify the restored tree. The pipeline halts at the first
//! failure, and the target is never touched before the restoration point is
//! durably on disk.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use restore_engine::{RestoreConfig, RestoreEngine, RetentionManager};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RestoreConfig::new("/var/lib/restore/points");
//! let engine = RestoreEngine::new(config.clone());
//!
//! let operation = engine.restore(Path::new("/backups/full-1"), Path::new("/build/target"));
//! if !operation.succeeded() {
//!     eprintln!("restore failed: {:?}", operation.error);
//!     if let Some(point) = &operation.restoration_point {
//!         engine.points().rollback(point)?;
//!     }
//! }
//!
//! // Drop restoration points older than two weeks
//! let summary = RetentionManager::new(config).prune(14)?;
//! println!("removed {} points", summary.removed.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Backup, RestorationPoint, RestoreOperation)
//! - **error**: Error types and handling
//! - **checksums**: Order-independent tree digests
//! - **metadata**: `KEY=value` metadata records
//! - **verify**: Backup verification and post-restore verification
//! - **points**: Restoration points, listing and rollback
//! - **restore**: The restore pipeline
//! - **retention**: Age-based pruning of restoration points
//! - **report**: Restore reports and JSON artifacts
//! - **archive**, **fs_ops**, **lock**: Filesystem plumbing
//! - **progress**: Observer trait for front-ends

pub mod archive;
pub mod checksums;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod lock;
pub mod metadata;
pub mod model;
pub mod points;
pub mod progress;
pub mod report;
pub mod restore;
pub mod retention;
pub mod verify;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types and functions
pub use checksums::{checksum_directory, ChecksumAlgorithm, ChecksumValue, Manifest};
pub use config::RestoreConfig;
pub use error::{EngineError, RestoreError};
pub use model::{
    Backup, BackupType, PointSummary, RestorationPoint, RestoreOperation, RestoreStatus,
    VerificationOutcome,
};
pub use points::{RestorationPointManager, RollbackOutcome};
pub use progress::RestoreObserver;
pub use report::{format_bytes, Reporter, RestoreReport};
pub use restore::{RestoreEngine, RestorePlan};
pub use retention::{PruneSummary, RetentionManager};
pub use verify::{verify, verify_backup, VerifiedBackup};
