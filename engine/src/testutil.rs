//! Fixtures for unit tests: temporary trees and backups of every type,
//! produced with the crate's own archive writer.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;

use crate::archive;
use crate::checksums::{ChecksumAlgorithm, Manifest};
use crate::config::RestoreConfig;
use crate::metadata::{BackupMetadata, MetadataRecord};
use crate::model::{BackupType, BACKUP_ARCHIVE_FILE, BACKUP_METADATA_FILE, SNAPSHOT_DATA_DIR};

static CWD: Mutex<()> = Mutex::new(());

/// Run `f` with `dir` as the working directory. Calls are serialized and the
/// previous directory is restored afterwards.
pub fn in_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
    let _guard = CWD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = std::env::current_dir().expect("Failed to read working directory");
    std::env::set_current_dir(dir).expect("Failed to change working directory");
    let result = f();
    std::env::set_current_dir(previous).expect("Failed to restore working directory");
    result
}

pub struct Fixture {
    _dir: TempDir,
    pub root: PathBuf,
    pub backups: PathBuf,
    pub points: PathBuf,
}

pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    fs::create_dir_all(root).expect("Failed to create tree root");
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).expect("Failed to create parent");
        fs::write(path, content).expect("Failed to write file");
    }
}

/// Overwrite one key of a backup's metadata.
pub fn set_meta(backup: &Path, key: &str, value: &str) {
    let path = backup.join(BACKUP_METADATA_FILE);
    let mut record = MetadataRecord::read(&path).expect("Failed to read metadata");
    record.set(key, value);
    record.write(&path).expect("Failed to write metadata");
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = dir.path().to_path_buf();
        let backups = root.join("backups");
        let points = root.join("points");
        fs::create_dir_all(&backups).unwrap();
        Fixture {
            _dir: dir,
            root,
            backups,
            points,
        }
    }

    pub fn config(&self) -> RestoreConfig {
        RestoreConfig::new(&self.points).with_compression_level(1)
    }

    /// A plain directory tree under the fixture root.
    pub fn tree(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.root.join("trees").join(name);
        write_files(&root, files);
        root
    }

    fn write_backup_meta(
        &self,
        dir: &Path,
        backup_type: BackupType,
        manifest: &Manifest,
        parent: Option<&str>,
    ) {
        let mut metadata = BackupMetadata::new(backup_type, manifest.digest());
        metadata.parent = parent.map(PathBuf::from);
        metadata.write(&dir.join(BACKUP_METADATA_FILE)).expect("Failed to write metadata");
    }

    pub fn full_backup(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let source = self.tree(&format!("{}-source", name), files);
        let dir = self.backups.join(name);
        fs::create_dir_all(&dir).unwrap();
        archive::pack_directory(&source, &dir.join(BACKUP_ARCHIVE_FILE), 1)
            .expect("Failed to pack");
        let manifest = Manifest::from_directory(&source, ChecksumAlgorithm::Sha256).unwrap();
        self.write_backup_meta(&dir, BackupType::Full, &manifest, None);
        dir
    }

    /// Incremental backup over `parent` (a sibling backup name). The recorded
    /// checksum is that of the parent's tree with the delta laid on top.
    pub fn incremental_backup(&self, name: &str, parent: &str, delta: &[(&str, &str)]) -> PathBuf {
        let source = self.tree(&format!("{}-delta", name), delta);
        let dir = self.backups.join(name);
        fs::create_dir_all(&dir).unwrap();
        archive::pack_directory(&source, &dir.join(BACKUP_ARCHIVE_FILE), 1)
            .expect("Failed to pack");

        let algo = ChecksumAlgorithm::Sha256;
        let parent_dir = self.backups.join(parent);
        let mut manifest = match fs::metadata(parent_dir.join(BACKUP_ARCHIVE_FILE)) {
            Ok(_) => {
                archive::manifest_of_archive(&parent_dir.join(BACKUP_ARCHIVE_FILE), algo).unwrap()
            }
            Err(_) => Manifest::new(algo),
        };
        manifest.overlay(Manifest::from_directory(&source, algo).unwrap());
        self.write_backup_meta(&dir, BackupType::Incremental, &manifest, Some(parent));
        dir
    }

    pub fn snapshot_backup(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.backups.join(name);
        let data = dir.join(SNAPSHOT_DATA_DIR);
        write_files(&data, files);
        let manifest = Manifest::from_directory(&data, ChecksumAlgorithm::Sha256).unwrap();
        self.write_backup_meta(&dir, BackupType::Snapshot, &manifest, None);
        dir
    }

    /// A target directory with pre-existing content.
    pub fn target(&self, files: &[(&str, &str)]) -> PathBuf {
        let target = self.root.join("target");
        write_files(&target, files);
        target
    }
}
