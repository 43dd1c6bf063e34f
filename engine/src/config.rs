//! Explicit configuration passed to every component.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumAlgorithm;

/// Default gzip level for restoration point archives.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Configuration shared by the restore engine, restoration point manager,
/// retention manager and reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Where restoration points and target lock files are kept
    pub points_dir: PathBuf,

    /// Where JSON report artifacts are written; none when unset
    #[serde(default)]
    pub reports_dir: Option<PathBuf>,

    /// Digest algorithm for new restoration points
    #[serde(default)]
    pub algorithm: ChecksumAlgorithm,

    /// Gzip level (0-9) for restoration point archives
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl RestoreConfig {
    pub fn new(points_dir: impl Into<PathBuf>) -> Self {
        RestoreConfig {
            points_dir: points_dir.into(),
            reports_dir: None,
            algorithm: ChecksumAlgorithm::default(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(reports_dir.into());
        self
    }

    pub fn with_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Levels above 9 are clamped.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn points_dir(&self) -> &Path {
        &self.points_dir
    }

    /// Directory holding per-target lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.points_dir.join("locks")
    }

    /// Staging area used while pruning restoration points.
    pub fn trash_dir(&self) -> PathBuf {
        self.points_dir.join(".trash")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RestoreConfig::new("/var/lib/restore/points");
        assert_eq!(config.algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(config.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(config.locks_dir(), PathBuf::from("/var/lib/restore/points/locks"));
        assert!(config.reports_dir.is_none());
    }

    #[test]
    fn test_builder_clamps_compression_level() {
        let config = RestoreConfig::new("p")
            .with_compression_level(42)
            .with_algorithm(ChecksumAlgorithm::Blake3)
            .with_reports_dir("r");
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.algorithm, ChecksumAlgorithm::Blake3);
        assert_eq!(config.reports_dir, Some(PathBuf::from("r")));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: RestoreConfig =
            serde_json::from_str(r#"{"points_dir": "/points", "algorithm": "md5"}"#).unwrap();
        assert_eq!(config.points_dir, PathBuf::from("/points"));
        assert_eq!(config.algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(config.compression_level, DEFAULT_COMPRESSION_LEVEL);
    }
}
