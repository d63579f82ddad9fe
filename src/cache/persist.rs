//! Best-effort cache snapshot on local disk.
//!
//! Snapshots are written whole (temp file + rename). Writes may race; each
//! snapshot carries the cache generation it was taken at, and an older
//! generation never overwrites a newer one.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheEntry;
use crate::error::Result;
use crate::util::{atomic_write_json, read_to_string_limited};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<CacheEntry>,
}

/// Snapshot writer/reader for one cache file.
#[derive(Debug)]
pub struct CachePersistence {
    path: PathBuf,
    /// Generation of the last snapshot written; also serializes writers.
    last_written: Mutex<Option<u64>>,
}

impl CachePersistence {
    /// Create a persistence handle for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(None),
        }
    }

    /// Snapshot file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load entries from the snapshot file.
    ///
    /// A missing file yields no entries.
    pub fn load(&self) -> Result<Vec<CacheEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = read_to_string_limited(&self.path)?;
        let snapshot: CacheSnapshot = serde_json::from_str(&content)?;
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                version = snapshot.version,
                "unknown cache snapshot version, loading anyway"
            );
        }
        Ok(snapshot.entries)
    }

    /// Write a snapshot taken at `generation`.
    ///
    /// Returns `Ok(false)` when a newer generation is already on disk.
    pub fn save(&self, entries: Vec<CacheEntry>, generation: u64) -> Result<bool> {
        let mut last_written = self.last_written.lock();
        if matches!(*last_written, Some(done) if done >= generation) {
            return Ok(false);
        }

        let snapshot = CacheSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entries,
        };
        atomic_write_json(&self.path, &snapshot)?;
        *last_written = Some(generation);

        tracing::debug!(
            path = %self.path.display(),
            entries = snapshot.entries.len(),
            generation,
            "saved cache snapshot"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Metadata;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(
            key.to_string(),
            json!(key),
            "thought",
            Metadata::new(),
            "ci1",
            1,
        )
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let persistence = CachePersistence::new(dir.path().join("cache.json"));
        assert!(persistence.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let persistence = CachePersistence::new(dir.path().join("esr").join("cache.json"));

        assert!(persistence.save(vec![entry("a"), entry("b")], 1).unwrap());

        let loaded = persistence.load().unwrap();
        let keys: Vec<_> = loaded.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_older_generation_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let persistence = CachePersistence::new(dir.path().join("cache.json"));

        assert!(persistence.save(vec![entry("new")], 5).unwrap());
        assert!(!persistence.save(vec![entry("old")], 3).unwrap());

        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "new");
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(CachePersistence::new(&path).load().is_err());
    }
}
