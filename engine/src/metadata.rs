//! Metadata store.
//!
//! Backups and restoration points each carry a flat `KEY=value` text record.
//! `MetadataRecord` is the untyped codec; `BackupMetadata` and `PointMetadata`
//! are typed views that validate their required keys eagerly, so a missing
//! or empty value is reported as an error instead of flowing on as "".

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::checksums::{ChecksumAlgorithm, ChecksumValue};
use crate::error::EngineError;
use crate::fs_ops;
use crate::model::BackupType;

pub const KEY_TYPE: &str = "TYPE";
pub const KEY_CHECKSUM: &str = "CHECKSUM";
pub const KEY_ALGORITHM: &str = "ALGORITHM";
pub const KEY_TIMESTAMP: &str = "TIMESTAMP";
pub const KEY_TARGET: &str = "TARGET";
pub const KEY_PARENT: &str = "PARENT";

/// Untyped `KEY=value` record.
///
/// Parsing ignores blank lines and `#` comments, trims whitespace around keys
/// and values, and keeps the last value when a key repeats. Keys are
/// serialized in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRecord {
    fields: BTreeMap<String, String>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse record text. `path` is only used for error reporting.
    pub fn parse(content: &str, path: &Path) -> Result<Self, EngineError> {
        let mut fields = BTreeMap::new();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| EngineError::MalformedMetadata {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: raw.to_string(),
                })?;

            let key = key.trim();
            if key.is_empty() {
                return Err(EngineError::MalformedMetadata {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: raw.to_string(),
                });
            }

            fields.insert(key.to_string(), value.trim().to_string());
        }

        Ok(MetadataRecord { fields })
    }

    pub fn read(path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content, path)
    }

    /// Serialize to record text.
    pub fn render(&self) -> String {
        let mut result = String::new();
        for (key, value) in &self.fields {
            result.push_str(key);
            result.push('=');
            result.push_str(value);
            result.push('\n');
        }
        result
    }

    /// Write durably (temp file, fsync, rename).
    pub fn write(&self, path: &Path) -> Result<(), EngineError> {
        fs_ops::write_file_durable(path, self.render().as_bytes())
    }

    /// Value for `key`; empty values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        // Values are single-line by construction
        let value = value.replace(['\n', '\r'], " ");
        self.fields.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn require(&self, key: &'static str, path: &Path) -> Result<&str, EngineError> {
        self.get(key).ok_or_else(|| EngineError::MissingMetadataKey {
            path: path.to_path_buf(),
            key,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

fn parse_algorithm(record: &MetadataRecord, path: &Path) -> Result<ChecksumAlgorithm, EngineError> {
    match record.get(KEY_ALGORITHM) {
        None => Ok(ChecksumAlgorithm::default()),
        Some(value) => {
            ChecksumAlgorithm::parse(value).ok_or_else(|| EngineError::InvalidMetadataValue {
                path: path.to_path_buf(),
                key: KEY_ALGORITHM,
                reason: format!("unknown algorithm {:?}", value),
            })
        }
    }
}

fn parse_checksum(
    record: &MetadataRecord,
    algorithm: ChecksumAlgorithm,
    path: &Path,
) -> Result<ChecksumValue, EngineError> {
    let raw = record.require(KEY_CHECKSUM, path)?;
    ChecksumValue::parse_with_default(raw, algorithm).map_err(|reason| {
        EngineError::InvalidMetadataValue {
            path: path.to_path_buf(),
            key: KEY_CHECKSUM,
            reason,
        }
    })
}

fn parse_timestamp(value: &str, path: &Path) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::InvalidMetadataValue {
            path: path.to_path_buf(),
            key: KEY_TIMESTAMP,
            reason: e.to_string(),
        })
}

/// Typed view of a backup's `backup.meta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetadata {
    /// TYPE (required)
    pub backup_type: BackupType,
    /// CHECKSUM (required): digest of the tree the backup restores to
    pub checksum: ChecksumValue,
    /// TIMESTAMP (optional)
    pub timestamp: Option<DateTime<Utc>>,
    /// TARGET (optional): directory the backup was taken from
    pub target: Option<PathBuf>,
    /// PARENT (required for incremental backups)
    pub parent: Option<PathBuf>,
    /// Producer-defined keys, preserved verbatim
    pub extra: BTreeMap<String, String>,
}

impl BackupMetadata {
    pub fn new(backup_type: BackupType, checksum: ChecksumValue) -> Self {
        BackupMetadata {
            backup_type,
            checksum,
            timestamp: None,
            target: None,
            parent: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn from_record(record: &MetadataRecord, path: &Path) -> Result<Self, EngineError> {
        let backup_type = BackupType::parse(record.require(KEY_TYPE, path)?);
        let algorithm = parse_algorithm(record, path)?;
        let checksum = parse_checksum(record, algorithm, path)?;
        let timestamp = record
            .get(KEY_TIMESTAMP)
            .map(|v| parse_timestamp(v, path))
            .transpose()?;

        let known = [
            KEY_TYPE,
            KEY_CHECKSUM,
            KEY_ALGORITHM,
            KEY_TIMESTAMP,
            KEY_TARGET,
            KEY_PARENT,
        ];
        let extra = record
            .keys()
            .filter(|k| !known.contains(k))
            .filter_map(|k| record.get(k).map(|v| (k.to_string(), v.to_string())))
            .collect();

        Ok(BackupMetadata {
            backup_type,
            checksum,
            timestamp,
            target: record.get(KEY_TARGET).map(PathBuf::from),
            parent: record.get(KEY_PARENT).map(PathBuf::from),
            extra,
        })
    }

    pub fn to_record(&self) -> MetadataRecord {
        let mut record = MetadataRecord::new();
        for (key, value) in &self.extra {
            record.set(key.clone(), value.clone());
        }
        record.set(KEY_TYPE, self.backup_type.as_str());
        record.set(KEY_CHECKSUM, self.checksum.hex());
        record.set(KEY_ALGORITHM, self.checksum.algorithm().to_string());
        if let Some(timestamp) = self.timestamp {
            record.set(KEY_TIMESTAMP, timestamp.to_rfc3339());
        }
        if let Some(target) = &self.target {
            record.set(KEY_TARGET, target.to_string_lossy());
        }
        if let Some(parent) = &self.parent {
            record.set(KEY_PARENT, parent.to_string_lossy());
        }
        record
    }

    pub fn read(path: &Path) -> Result<Self, EngineError> {
        let record = MetadataRecord::read(path)?;
        Self::from_record(&record, path)
    }

    pub fn write(&self, path: &Path) -> Result<(), EngineError> {
        self.to_record().write(path)
    }
}

/// Typed view of a restoration point's `.meta` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointMetadata {
    /// TIMESTAMP (required)
    pub timestamp: DateTime<Utc>,
    /// TARGET (required)
    pub target: PathBuf,
    /// CHECKSUM (required): digest of the target at capture time
    pub checksum: ChecksumValue,
}

impl PointMetadata {
    pub fn from_record(record: &MetadataRecord, path: &Path) -> Result<Self, EngineError> {
        let timestamp = parse_timestamp(record.require(KEY_TIMESTAMP, path)?, path)?;
        let target = PathBuf::from(record.require(KEY_TARGET, path)?);
        let algorithm = parse_algorithm(record, path)?;
        let checksum = parse_checksum(record, algorithm, path)?;

        Ok(PointMetadata {
            timestamp,
            target,
            checksum,
        })
    }

    pub fn to_record(&self) -> MetadataRecord {
        let mut record = MetadataRecord::new();
        record.set(KEY_TIMESTAMP, self.timestamp.to_rfc3339());
        record.set(KEY_TARGET, self.target.to_string_lossy());
        record.set(KEY_CHECKSUM, self.checksum.hex());
        record.set(KEY_ALGORITHM, self.checksum.algorithm().to_string());
        record
    }

    pub fn read(path: &Path) -> Result<Self, EngineError> {
        let record = MetadataRecord::read(path)?;
        Self::from_record(&record, path)
    }

    pub fn write(&self, path: &Path) -> Result<(), EngineError> {
        self.to_record().write(path)
    }
}
