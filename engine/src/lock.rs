//! Exclusive per-target lock.
//!
//! A restore or rollback holds the lock from checkpointing through result
//! verification. The lock is advisory (`flock`/`LockFileEx` via fs2) and is
//! released when the guard is dropped, including when the process dies.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::checksums::{compute_bytes_checksum, ChecksumAlgorithm};
use crate::error::{EngineError, RestoreError};
use crate::fs_ops;

/// Held lock on a target directory.
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    lock_path: PathBuf,
    target: PathBuf,
}

/// Lock file path for `target` inside `locks_dir`.
///
/// Keyed on the resolved target, so every spelling of a directory shares one
/// lock whether or not the directory exists yet.
pub fn lock_path_for(locks_dir: &Path, target: &Path) -> PathBuf {
    let key = fs_ops::resolve_path(target);
    let digest = compute_bytes_checksum(
        key.to_string_lossy().as_bytes(),
        ChecksumAlgorithm::Blake3,
    );
    locks_dir.join(format!("{}.lock", &digest.hex()[..32]))
}

impl TargetLock {
    /// Take the lock without waiting. Fails with `TargetLocked` when another
    /// holder exists.
    pub fn acquire(locks_dir: &Path, target: &Path) -> Result<Self, RestoreError> {
        let checkpoint_error = |source: EngineError| RestoreError::Checkpoint {
            target: target.to_path_buf(),
            source,
        };

        fs_ops::ensure_dir(locks_dir).map_err(checkpoint_error)?;
        let lock_path = lock_path_for(locks_dir, target);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                checkpoint_error(EngineError::WriteError {
                    path: lock_path.clone(),
                    source: e,
                })
            })?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(RestoreError::TargetLocked {
                target: target.to_path_buf(),
            });
        }

        // Record who holds it; purely informational
        let _ = file.set_len(0);
        let _ = writeln!(file, "pid={}\ntarget={}", std::process::id(), target.display());

        debug!(target = %target.display(), lock = %lock_path.display(), "acquired target lock");
        Ok(TargetLock {
            file,
            lock_path,
            target: target.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(target = %self.target.display(), "released target lock");
    }
}
