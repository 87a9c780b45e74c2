//! Directory content fingerprints.
//!
//! A folder's hash covers only its immediate children: their kind, full path
//! and last-write time. Renaming or touching a child changes the hash; deeper
//! changes do not (they change the hash of the folder they happen in).

use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// One immediate child as seen by the hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub path: PathBuf,
    pub is_directory: bool,
    /// Last write time in ticks, see [`ticks`].
    pub modified_ticks: i64,
}

impl HashEntry {
    pub fn new(path: impl Into<PathBuf>, is_directory: bool, modified_ticks: i64) -> Self {
        Self { path: path.into(), is_directory, modified_ticks }
    }

    fn term(&self) -> String {
        let tag = if self.is_directory { 'D' } else { 'F' };
        format!("{tag}:{}:{}", self.path.display(), self.modified_ticks)
    }
}

/// Converts a timestamp into 100ns ticks since the Unix epoch, saturating at
/// the bounds of `i64` (roughly ±29,000 years).
pub fn ticks(timestamp: OffsetDateTime) -> i64 {
    let ticks = timestamp.unix_timestamp_nanos() / 100;
    i64::try_from(ticks).unwrap_or(if ticks < 0 { i64::MIN } else { i64::MAX })
}

/// Accumulates children and produces a deterministic fingerprint.
///
/// Directory enumeration order differs between platforms (and between runs
/// on some filesystems), so entries are sorted ordinally before hashing and
/// insertion order never matters.
#[derive(Debug, Default)]
pub struct HashBuilder {
    terms: Vec<String>,
}

impl HashBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: &HashEntry) -> &mut Self {
        self.terms.push(entry.term());
        self
    }

    pub fn add_child(&mut self, path: &Path, is_directory: bool, modified: OffsetDateTime) -> &mut Self {
        self.add(&HashEntry::new(path, is_directory, ticks(modified)))
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Lowercase hex digest. An empty builder yields the digest of empty
    /// input, never an empty string.
    pub fn compute_hash(&self) -> String {
        let mut terms: Vec<&str> = self.terms.iter().map(String::as_str).collect();
        terms.sort_unstable();
        let mut hasher = blake3::Hasher::new();
        for term in terms {
            hasher.update(term.as_bytes());
            // Separator so that ["ab", "c"] and ["a", "bc"] differ.
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}
