//! File-based storage backend.
//!
//! Each key is stored as one JSON document in a directory. Every write goes
//! through its own temp file + rename, so concurrent stores of one key never
//! interfere and readers never see a partial document. Blocking file IO runs on tokio's blocking pool so a
//! slow disk cannot stall the executor.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backends::traits::{MemoryResponse, Metadata, SearchHit, StorageBackend};
use crate::error::{EngramError, Result};
use crate::util::{atomic_write_json, content_matches, file_safe_key, read_to_string_limited};

/// On-disk document format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileDocument {
    key: String,
    value: Value,
    #[serde(default)]
    metadata: Metadata,
    stored_at: DateTime<Utc>,
}

/// File-based storage backend.
#[derive(Debug, Clone)]
pub struct FileBackend {
    name: String,
    dir: PathBuf,
}

impl FileBackend {
    /// Create a file backend rooted at `dir`, creating it if needed.
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| EngramError::storage(&dir, e))?;
        }
        Ok(Self {
            name: name.into(),
            dir,
        })
    }

    /// Directory holding the documents.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `key`.
    ///
    /// Keys that are not already file-safe get a digest suffix so that two
    /// keys sanitizing to the same name do not share a file.
    fn document_path(&self, key: &str) -> PathBuf {
        let safe = file_safe_key(key);
        let file_name = if safe == key {
            format!("{}.json", safe)
        } else {
            let digest = hex::encode(Sha256::digest(key.as_bytes()));
            format!("{}-{}.json", safe, &digest[..8])
        };
        self.dir.join(file_name)
    }

    fn read_document(path: &Path, key: &str) -> Result<Option<FileDocument>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = read_to_string_limited(path)?;
        let doc: FileDocument = serde_json::from_str(&content)?;
        if doc.key != key {
            return Ok(None);
        }
        Ok(Some(doc))
    }

    /// Scan every document for content matching `needle`, in key order.
    ///
    /// Temp files and unreadable documents are skipped.
    fn scan(dir: &Path, needle: &str, limit: usize) -> Result<Vec<FileDocument>> {
        let entries = std::fs::read_dir(dir).map_err(|e| EngramError::storage(dir, e))?;

        let mut matches = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_document = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_document {
                continue;
            }

            let doc = match read_to_string_limited(&path)
                .and_then(|content| Ok(serde_json::from_str::<FileDocument>(&content)?))
            {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable document");
                    continue;
                }
            };
            if content_matches(&doc.value, needle) {
                matches.push(doc);
            }
        }

        matches.sort_by(|a, b| a.key.cmp(&b.key));
        matches.truncate(limit);
        Ok(matches)
    }

    fn to_response(&self, doc: FileDocument) -> MemoryResponse {
        let mut metadata = doc.metadata;
        metadata.insert(
            "stored_at".to_string(),
            Value::String(doc.stored_at.to_rfc3339()),
        );
        MemoryResponse::new(doc.value, &self.name).with_metadata(metadata)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, key: &str, value: &Value, metadata: &Metadata) -> Result<bool> {
        let path = self.document_path(key);
        let doc = FileDocument {
            key: key.to_string(),
            value: value.clone(),
            metadata: metadata.clone(),
            stored_at: Utc::now(),
        };

        tokio::task::spawn_blocking(move || atomic_write_json(&path, &doc))
            .await
            .map_err(|e| EngramError::backend(&self.name, format!("write task failed: {}", e)))??;

        tracing::debug!(backend = %self.name, key, "wrote document");
        Ok(true)
    }

    async fn retrieve(&self, key: &str) -> Result<Option<MemoryResponse>> {
        let path = self.document_path(key);
        let owned_key = key.to_string();

        let doc = tokio::task::spawn_blocking(move || Self::read_document(&path, &owned_key))
            .await
            .map_err(|e| EngramError::backend(&self.name, format!("read task failed: {}", e)))??;

        Ok(doc.map(|doc| self.to_response(doc)))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let dir = self.dir.clone();
        let needle = query.to_lowercase();

        let docs = tokio::task::spawn_blocking(move || Self::scan(&dir, &needle, limit))
            .await
            .map_err(|e| EngramError::backend(&self.name, format!("search task failed: {}", e)))??;

        Ok(docs
            .into_iter()
            .map(|doc| SearchHit::new(doc.key.clone(), self.to_response(doc)))
            .collect())
    }

    async fn ping(&self) -> bool {
        self.dir.is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_backend() -> (FileBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new("file", dir.path().join("docs")).unwrap();
        (backend, dir)
    }

    #[test]
    fn test_new_creates_directory() {
        let (backend, _dir) = create_test_backend();
        assert!(backend.dir().is_dir());
    }

    #[tokio::test]
    async fn test_store_then_retrieve() {
        let (backend, _dir) = create_test_backend();
        let value = json!({"thought": "storage is free"});

        assert!(backend.store("abc123", &value, &Metadata::new()).await.unwrap());

        let response = backend.retrieve("abc123").await.unwrap().unwrap();
        assert_eq!(response.content, value);
        assert_eq!(response.source_backend, "file");
        assert!(backend.dir().join("abc123.json").exists());
    }

    #[tokio::test]
    async fn test_retrieve_missing_is_none() {
        let (backend, _dir) = create_test_backend();
        assert!(backend.retrieve("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsafe_keys_do_not_collide() {
        let (backend, _dir) = create_test_backend();

        backend.store("a/b", &json!("slash"), &Metadata::new()).await.unwrap();
        backend.store("a_b", &json!("underscore"), &Metadata::new()).await.unwrap();

        let slash = backend.retrieve("a/b").await.unwrap().unwrap();
        let underscore = backend.retrieve("a_b").await.unwrap().unwrap();
        assert_eq!(slash.content, json!("slash"));
        assert_eq!(underscore.content, json!("underscore"));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let (backend, _dir) = create_test_backend();
        std::fs::write(backend.dir().join("broken.json"), "{not json").unwrap();

        let result = backend.retrieve("broken").await;
        assert!(matches!(result, Err(EngramError::Serde { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_of_one_key_all_succeed() {
        let (backend, _dir) = create_test_backend();

        for round in 0..5 {
            let writes: Vec<_> = (0..16)
                .map(|i| {
                    let backend = backend.clone();
                    tokio::spawn(async move {
                        backend
                            .store("k", &json!({"round": round, "writer": i}), &Metadata::new())
                            .await
                    })
                })
                .collect();

            for write in writes {
                assert!(write.await.unwrap().unwrap());
            }

            let response = backend.retrieve("k").await.unwrap().unwrap();
            assert_eq!(response.content["round"], json!(round));
        }

        let names: Vec<String> = std::fs::read_dir(backend.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.json"]);
    }

    #[tokio::test]
    async fn test_search_scans_documents() {
        let (backend, _dir) = create_test_backend();
        backend.store("b", &json!("Storage is FREE"), &Metadata::new()).await.unwrap();
        backend.store("a/x", &json!({"note": "free lunch"}), &Metadata::new()).await.unwrap();
        backend.store("c", &json!("nothing"), &Metadata::new()).await.unwrap();
        std::fs::write(backend.dir().join("broken.json"), "{not json").unwrap();

        let hits = backend.search("free", 10).await.unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["a/x", "b"]);
        assert_eq!(hits[0].response.source_backend, "file");
        assert!(hits[0].response.metadata.contains_key("stored_at"));

        assert_eq!(backend.search("free", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_reflects_directory() {
        let (backend, dir) = create_test_backend();
        assert!(backend.ping().await);

        drop(dir);
        assert!(!backend.ping().await);
    }
}
