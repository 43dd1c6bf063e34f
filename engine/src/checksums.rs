//! Checksum engine.
//!
//! This module provides:
//! - Multiple checksum algorithms (MD5, SHA-256, BLAKE3)
//! - File-level checksum computation
//! - `Manifest`, the order-independent digest of a directory tree
//!
//! A tree digest is built from `(relative path, file digest)` pairs sorted by
//! path, rendered as `"<hex>  <path>\n"` lines and digested once more. A
//! path containing a backslash or a newline is escaped and its line prefixed
//! with a backslash, as `sha256sum` does, so distinct trees render to
//! distinct text. Two trees with the same relative paths and contents produce the same digest
//! no matter how the filesystem enumerates them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::EngineError;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (weak, kept for md5sum-style producers)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl ChecksumAlgorithm {
    /// Parse algorithm from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha256" => Some(Self::Sha256),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }

    /// Length of the hex digest this algorithm produces
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 | Self::Blake3 => 64,
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    /// Create a new checksum value. Hex digits are normalized to lowercase.
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        ChecksumValue {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Get the algorithm
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Get the hex string representation
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }

    /// Parse a hex digest, optionally prefixed with "algo:", using
    /// `default_algorithm` when no prefix is present.
    pub fn parse_with_default(
        s: &str,
        default_algorithm: ChecksumAlgorithm,
    ) -> Result<Self, String> {
        let s = s.trim();
        let (algorithm, hex) = match s.split_once(':') {
            Some((algo, hex)) => {
                let algorithm = ChecksumAlgorithm::parse(algo)
                    .ok_or_else(|| format!("unknown checksum algorithm {:?}", algo))?;
                (algorithm, hex)
            }
            None => (default_algorithm, s),
        };

        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "expected {} hex digits for {}, got {:?}",
                algorithm.hex_len(),
                algorithm,
                hex
            ));
        }

        Ok(ChecksumValue::new(algorithm, hex))
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

impl FromStr for ChecksumValue {
    type Err = String;

    /// Parses "algo:hex", or bare hex as SHA-256.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default(s, ChecksumAlgorithm::Sha256)
    }
}

/// Trait for computing checksums
pub trait ChecksumHasher {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the checksum value
    fn finalize(self: Box<Self>) -> ChecksumValue;
}

/// MD5 hasher (backed by md5 crate)
struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

/// BLAKE3 hasher (backed by blake3 crate)
struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Digest everything `reader` yields. `path` is only used for error reporting.
pub fn compute_reader_checksum<R: Read>(
    mut reader: R,
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<(ChecksumValue, u64), EngineError> {
    let mut hasher = create_hasher(algorithm);
    let mut buffer = [0u8; 65536]; // 64 KB buffer
    let mut total = 0u64;

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buffer[..n]);
                total += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::ReadError {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Ok((hasher.finalize(), total))
}

/// Digest of a byte string (used for symlink targets and lock names).
pub fn compute_bytes_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> ChecksumValue {
    let mut hasher = create_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Convert a relative path into the `/`-separated key used in manifests.
///
/// Rejects absolute paths, `..` components and non UTF-8 names so that two
/// distinct files can never collapse onto the same key.
pub fn manifest_key(relative: &Path) -> Result<String, EngineError> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                let name = name.to_str().ok_or_else(|| EngineError::InvalidPath {
                    path: relative.to_path_buf(),
                    reason: "path is not valid UTF-8".to_string(),
                })?;
                parts.push(name);
            }
            Component::CurDir => {}
            _ => {
                return Err(EngineError::InvalidPath {
                    path: relative.to_path_buf(),
                    reason: "path must be relative and stay inside its root".to_string(),
                })
            }
        }
    }
    Ok(parts.join("/"))
}

/// Escape `\\` and newlines so a key always renders on one line.
fn escape_key(key: &str) -> std::borrow::Cow<'_, str> {
    if !key.contains(['\\', '\n']) {
        return std::borrow::Cow::Borrowed(key);
    }
    let mut escaped = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    std::borrow::Cow::Owned(escaped)
}

/// One file of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Digest of the content (or of the link target for symlinks)
    pub checksum: ChecksumValue,
    /// Content size in bytes; 0 for symlinks
    pub size: u64,
}

/// Order-independent description of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    algorithm: ChecksumAlgorithm,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Manifest {
            algorithm,
            entries: BTreeMap::new(),
        }
    }

    /// Build a manifest of every file and symlink below `root`.
    ///
    /// Fails on the first unreadable entry; a digest is never produced over a
    /// partially read tree.
    pub fn from_directory(root: &Path, algorithm: ChecksumAlgorithm) -> Result<Self, EngineError> {
        let mut manifest = Manifest::new(algorithm);

        for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                EngineError::EnumerationFailed {
                    path,
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop detected")),
                }
            })?;

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| EngineError::InvalidPath {
                    path: entry.path().to_path_buf(),
                    reason: format!("not below {}", root.display()),
                })?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                continue;
            }

            let key = manifest_key(relative)?;
            if file_type.is_symlink() {
                let link = std::fs::read_link(entry.path()).map_err(|e| EngineError::ReadError {
                    path: entry.path().to_path_buf(),
                    source: e,
                })?;
                manifest.insert_symlink(key, &link);
            } else {
                let file = File::open(entry.path()).map_err(|e| EngineError::ReadError {
                    path: entry.path().to_path_buf(),
                    source: e,
                })?;
                let (checksum, size) = compute_reader_checksum(file, entry.path(), algorithm)?;
                manifest.insert(key, ManifestEntry { checksum, size });
            }
        }

        Ok(manifest)
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, key: String, entry: ManifestEntry) {
        self.entries.insert(key, entry);
    }

    /// Record a symlink; its digest covers the link target text.
    pub fn insert_symlink(&mut self, key: String, link_target: &Path) {
        let checksum = compute_bytes_checksum(
            link_target.to_string_lossy().as_bytes(),
            self.algorithm,
        );
        self.entries.insert(key, ManifestEntry { checksum, size: 0 });
    }

    /// Lay `upper` over `self`: entries present in both take `upper`'s value.
    /// This is what extracting one archive on top of another produces.
    pub fn overlay(&mut self, upper: Manifest) {
        self.entries.extend(upper.entries);
    }

    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.get(key)
    }

    pub fn file_count(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Render as `"<hex>  <path>"` lines, sorted by path.
    pub fn render(&self) -> String {
        let mut result = String::new();
        for (path, entry) in &self.entries {
            let escaped = escape_key(path);
            if escaped.len() != path.len() {
                result.push('\\');
            }
            result.push_str(entry.checksum.hex());
            result.push_str("  ");
            result.push_str(&escaped);
            result.push('\n');
        }
        result
    }

    /// The composite tree digest.
    pub fn digest(&self) -> ChecksumValue {
        compute_bytes_checksum(self.render().as_bytes(), self.algorithm)
    }
}

/// Compute the tree digest of a directory.
pub fn checksum_directory(
    root: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    Manifest::from_directory(root, algorithm).map(|m| m.digest())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(ChecksumAlgorithm::parse("md5"), Some(ChecksumAlgorithm::Md5));
        assert_eq!(ChecksumAlgorithm::parse("SHA256"), Some(ChecksumAlgorithm::Sha256));
        assert_eq!(ChecksumAlgorithm::parse("blake3"), Some(ChecksumAlgorithm::Blake3));
        assert_eq!(ChecksumAlgorithm::parse("crc32"), None);
    }

    #[test]
    fn test_md5_hasher() {
        let checksum = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Md5);
        assert_eq!(checksum.algorithm(), ChecksumAlgorithm::Md5);
        assert_eq!(checksum.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_hasher() {
        let checksum = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Sha256);
        assert_eq!(
            checksum.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_blake3_hasher_streaming_matches_one_shot() {
        let mut hasher = create_hasher(ChecksumAlgorithm::Blake3);
        hasher.update(b"hel");
        hasher.update(b"lo");
        let streamed = hasher.finalize();
        assert_eq!(streamed, compute_bytes_checksum(b"hello", ChecksumAlgorithm::Blake3));
        assert_eq!(streamed.hex(), blake3::hash(b"hello").to_hex().as_str());
    }

    #[test]
    fn test_checksum_value_parse() {
        let sha = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let bare: ChecksumValue = sha.parse().unwrap();
        assert_eq!(bare.algorithm(), ChecksumAlgorithm::Sha256);

        let prefixed: ChecksumValue = format!("sha256:{}", sha.to_uppercase()).parse().unwrap();
        assert_eq!(prefixed, bare);
        assert_eq!(prefixed.to_string_with_algo(), format!("sha256:{}", sha));

        assert!("sha256:abc".parse::<ChecksumValue>().is_err());
        assert!("crc32:00000000".parse::<ChecksumValue>().is_err());
        let md5 = ChecksumValue::parse_with_default(
            "5d41402abc4b2a76b9719d911017c592",
            ChecksumAlgorithm::Md5,
        )
        .unwrap();
        assert_eq!(md5.algorithm(), ChecksumAlgorithm::Md5);
    }

    #[test]
    fn test_directory_digest_ignores_creation_order() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");

        write(&a, "one.txt", b"1");
        write(&a, "nested/two.txt", b"2");
        write(&a, "z.txt", b"z");

        write(&b, "z.txt", b"z");
        write(&b, "nested/two.txt", b"2");
        write(&b, "one.txt", b"1");

        let da = checksum_directory(&a, ChecksumAlgorithm::Sha256).unwrap();
        let db = checksum_directory(&b, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(da, db);
    }

    #[test]
    fn test_directory_digest_changes_with_content() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("tree");
        write(&root, "src/main.c", b"int main() { return 0; }");
        write(&root, "Makefile", b"all:");

        let before = checksum_directory(&root, ChecksumAlgorithm::Sha256).unwrap();
        write(&root, "src/main.c", b"int main() { return 1; }");
        let after = checksum_directory(&root, ChecksumAlgorithm::Sha256).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_directory_digest_changes_with_path_set() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("tree");
        write(&root, "a.txt", b"same");
        let before = checksum_directory(&root, ChecksumAlgorithm::Blake3).unwrap();

        fs::rename(root.join("a.txt"), root.join("b.txt")).unwrap();
        let renamed = checksum_directory(&root, ChecksumAlgorithm::Blake3).unwrap();
        assert_ne!(before, renamed);
    }

    #[cfg(unix)]
    #[test]
    fn test_newline_in_file_name_cannot_forge_another_tree() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let two_files = temp_dir.path().join("two");
        write(&two_files, "a", b"X");
        write(&two_files, "b", b"Y");

        let y_hex = compute_bytes_checksum(b"Y", ChecksumAlgorithm::Sha256);
        let forged = temp_dir.path().join("forged");
        write(&forged, &format!("a\n{}  b", y_hex.hex()), b"X");

        let honest = checksum_directory(&two_files, ChecksumAlgorithm::Sha256).unwrap();
        let crafted = checksum_directory(&forged, ChecksumAlgorithm::Sha256).unwrap();
        assert_ne!(honest, crafted);

        let manifest = Manifest::from_directory(&forged, ChecksumAlgorithm::Sha256).unwrap();
        let rendered = manifest.render();
        assert_eq!(rendered.lines().count(), 1);
        assert!(rendered.starts_with('\\'));
        assert!(rendered.contains("a\\n"));
    }

    #[test]
    fn test_empty_directories_do_not_contribute() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("tree");
        write(&root, "a.txt", b"x");
        let before = checksum_directory(&root, ChecksumAlgorithm::Sha256).unwrap();
        fs::create_dir_all(root.join("empty/deeper")).unwrap();
        let after = checksum_directory(&root, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = checksum_directory(&temp_dir.path().join("nope"), ChecksumAlgorithm::Sha256);
        assert!(result.is_err());
    }

    #[test]
    fn test_manifest_overlay_replaces_shared_paths() {
        let algo = ChecksumAlgorithm::Sha256;
        let entry = |data: &[u8]| ManifestEntry {
            checksum: compute_bytes_checksum(data, algo),
            size: data.len() as u64,
        };

        let mut base = Manifest::new(algo);
        base.insert("config".to_string(), entry(b"v1"));
        base.insert("kept".to_string(), entry(b"k"));

        let mut delta = Manifest::new(algo);
        delta.insert("config".to_string(), entry(b"v2"));
        delta.insert("added".to_string(), entry(b"new"));

        base.overlay(delta);
        assert_eq!(base.file_count(), 3);
        assert_eq!(base.get("config"), Some(&entry(b"v2")));
        assert_eq!(base.total_bytes(), 2 + 1 + 3);
        assert!(base.render().starts_with(&format!(
            "{}  added\n",
            compute_bytes_checksum(b"new", algo).hex()
        )));
    }

    #[test]
    fn test_manifest_key_normalizes_and_rejects_escapes() {
        assert_eq!(manifest_key(Path::new("./a/b.txt")).unwrap(), "a/b.txt");
        assert!(manifest_key(Path::new("../etc/passwd")).is_err());
        assert!(manifest_key(Path::new("/abs")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_contributes_link_target() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("tree");
        write(&root, "real.txt", b"data");
        std::os::unix::fs::symlink("real.txt", root.join("link")).unwrap();

        let manifest = Manifest::from_directory(&root, ChecksumAlgorithm::Sha256).unwrap();
        let link = manifest.get("link").unwrap();
        assert_eq!(link.size, 0);
        assert_eq!(
            link.checksum,
            compute_bytes_checksum(b"real.txt", ChecksumAlgorithm::Sha256)
        );
    }
}
