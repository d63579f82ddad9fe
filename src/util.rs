//! Utility functions for Engram.
//!
//! Content canonicalization, key derivation, and the atomic file helpers
//! shared by the cache snapshot and the file backend.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{EngramError, Result};

/// Maximum file size that can be read into memory (64 MB).
///
/// Cache snapshots grow with the cache; anything past this is treated as
/// corrupt rather than loaded.
pub const MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Number of hex characters kept from the content digest.
pub const KEY_HEX_LEN: usize = 16;

/// Render content as display text.
///
/// Strings are used verbatim; everything else is serialized as JSON. Two
/// different values can render the same (`"1"` and `1`), so this is only for
/// display, sizing and text matching. Keys are derived by [`content_key`].
pub fn canonical_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Case-insensitive substring match of `needle` against content text.
///
/// `needle` must already be lowercase.
pub fn content_matches(content: &Value, needle: &str) -> bool {
    canonical_content(content).to_lowercase().contains(needle)
}

/// Derive the content-addressed key for a piece of content.
///
/// Format: first 16 hex chars of `sha256("<content_type>:<content as JSON>")`.
/// Every value is hashed as JSON text, so strings keep their quotes and never
/// share a key with the number, bool or null they spell. `serde_json` keeps
/// object keys sorted, so equal values always hash identically.
pub fn content_key(content: &Value, content_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_type.as_bytes());
    hasher.update(b":");
    hasher.update(content.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..KEY_HEX_LEN].to_string()
}

/// Map an arbitrary key to a file-safe name.
///
/// Alphanumerics, `-` and `_` pass through; everything else becomes `_`.
pub fn file_safe_key(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "_".to_string()
    } else {
        safe
    }
}

/// Read a file into a string with size limit protection.
///
/// # Errors
///
/// Returns an error if:
/// * The file cannot be read (doesn't exist, permission denied, etc.)
/// * The file exceeds `MAX_FILE_SIZE`
pub fn read_to_string_limited(path: &Path) -> Result<String> {
    read_to_string_with_limit(path, MAX_FILE_SIZE)
}

/// Read a file into a string with a custom size limit.
pub fn read_to_string_with_limit(path: &Path, max_size: u64) -> Result<String> {
    let metadata = fs::metadata(path).map_err(|e| EngramError::storage(path, e))?;

    let size = metadata.len();
    if size > max_size {
        return Err(EngramError::serde(format!(
            "File {} is too large ({} bytes, max {} bytes)",
            path.display(),
            size,
            max_size
        )));
    }

    fs::read_to_string(path).map_err(|e| EngramError::storage(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// Each call writes to its own uniquely named temp file next to `path`, syncs
/// it, then renames it over the destination. Concurrent writers to one path
/// never share a temp file, and readers see either the old or the new
/// document. Parent directories are created as needed.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.exists() {
        fs::create_dir_all(parent).map_err(|e| EngramError::storage(parent, e))?;
    }

    let json = serde_json::to_string_pretty(value)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let prefix = format!(".{}.", file_name);

    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| EngramError::storage(parent, e))?;
    temp.write_all(json.as_bytes())
        .map_err(|e| EngramError::storage(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| EngramError::storage(temp.path(), e))?;

    // Rename temp file to final path (atomic on POSIX)
    temp.persist(path)
        .map_err(|e| EngramError::storage(path, e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_content_key_is_stable_and_short() {
        let a = content_key(&json!("hello"), "thought");
        let b = content_key(&json!("hello"), "thought");
        assert_eq!(a, b);
        assert_eq!(a.len(), KEY_HEX_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_key_depends_on_type() {
        let thought = content_key(&json!("hello"), "thought");
        let fact = content_key(&json!("hello"), "fact");
        assert_ne!(thought, fact);
    }

    #[test]
    fn test_content_key_ignores_object_key_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(content_key(&a, "fact"), content_key(&b, "fact"));
    }

    #[test]
    fn test_content_key_distinguishes_json_types() {
        assert_ne!(content_key(&json!("1"), "fact"), content_key(&json!(1), "fact"));
        assert_ne!(
            content_key(&json!("true"), "fact"),
            content_key(&json!(true), "fact")
        );
        assert_ne!(
            content_key(&json!("null"), "fact"),
            content_key(&Value::Null, "fact")
        );
    }

    #[test]
    fn test_canonical_content_string_is_verbatim() {
        assert_eq!(canonical_content(&json!("plain text")), "plain text");
        assert_eq!(canonical_content(&json!(42)), "42");
    }

    #[test]
    fn test_content_matches_ignores_case() {
        assert!(content_matches(&json!("Storage is FREE"), "free"));
        assert!(content_matches(&json!({"note": "Apollo"}), "apollo"));
        assert!(!content_matches(&json!("nothing here"), "free"));
    }

    #[test]
    fn test_file_safe_key() {
        assert_eq!(file_safe_key("abc-123_x"), "abc-123_x");
        assert_eq!(file_safe_key("../etc/passwd"), "___etc_passwd");
        assert_eq!(file_safe_key(""), "_");
    }

    #[test]
    fn test_atomic_write_json_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("snapshot.json");

        atomic_write_json(&path, &json!({"k": "v"})).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["k"], "v");

        let leftovers: Vec<_> = fs::read_dir(temp.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("snapshot.json")]);
    }

    #[test]
    fn test_atomic_write_json_concurrent_same_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("shared.json");

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || atomic_write_json(&path, &json!({"writer": i})))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value["writer"].is_u64());
    }

    #[test]
    fn test_read_to_string_limited_nonexistent() {
        let temp = TempDir::new().unwrap();
        let result = read_to_string_limited(&temp.path().join("missing.json"));
        assert!(matches!(result, Err(EngramError::Storage { .. })));
    }

    #[test]
    fn test_read_to_string_with_limit_at_boundary() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("boundary.txt");
        fs::write(&path, "x".repeat(100)).unwrap();

        assert!(read_to_string_with_limit(&path, 100).is_ok());

        let err = read_to_string_with_limit(&path, 99).unwrap_err().to_string();
        assert!(err.contains("too large"));
        assert!(err.contains("max 99 bytes"));
    }
}
