//! Progress reporting trait.
//!
//! This module defines the RestoreObserver trait, which decouples the restore
//! engine from any specific front-end. The CLI implements it to print stage
//! progress to stderr.

use crate::model::{RestoreOperation, RestoreStatus};

/// Trait for receiving progress updates from a restore operation.
///
/// All methods are called synchronously on the restoring thread.
pub trait RestoreObserver: Send {
    /// Called after the operation has moved into `stage`.
    fn on_stage(&self, operation: &RestoreOperation, stage: RestoreStatus);

    /// Called once the operation reached `succeeded` or `failed`.
    fn on_completed(&self, operation: &RestoreOperation);
}
