//! In-process storage backend.
//!
//! Thread-safe map from key to stored document. Contents are lost when the
//! backend is dropped. Used as the default backend and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::backends::traits::{MemoryResponse, Metadata, SearchHit, StorageBackend};
use crate::error::Result;
use crate::util::content_matches;

#[derive(Debug, Clone)]
struct StoredDocument {
    value: Value,
    metadata: Metadata,
    stored_at: DateTime<Utc>,
}

/// In-memory storage backend.
#[derive(Debug)]
pub struct InMemoryBackend {
    name: String,
    documents: RwLock<HashMap<String, StoredDocument>>,
}

impl InMemoryBackend {
    /// Create a new empty backend registered under `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// Check if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Check if a key is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.documents.read().contains_key(key)
    }
}

impl StoredDocument {
    fn to_response(&self, backend: &str) -> MemoryResponse {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            "stored_at".to_string(),
            Value::String(self.stored_at.to_rfc3339()),
        );
        MemoryResponse::new(self.value.clone(), backend).with_metadata(metadata)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn store(&self, key: &str, value: &Value, metadata: &Metadata) -> Result<bool> {
        let doc = StoredDocument {
            value: value.clone(),
            metadata: metadata.clone(),
            stored_at: Utc::now(),
        };
        self.documents.write().insert(key.to_string(), doc);
        tracing::debug!(backend = %self.name, key, "stored document");
        Ok(true)
    }

    async fn retrieve(&self, key: &str) -> Result<Option<MemoryResponse>> {
        let documents = self.documents.read();
        Ok(documents.get(key).map(|doc| doc.to_response(&self.name)))
    }

    /// Matches are returned in key order.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let needle = query.to_lowercase();
        let documents = self.documents.read();

        let mut matches: Vec<(&String, &StoredDocument)> = documents
            .iter()
            .filter(|(_, doc)| content_matches(&doc.value, &needle))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(b.0));

        Ok(matches
            .into_iter()
            .take(limit)
            .map(|(key, doc)| SearchHit::new(key.clone(), doc.to_response(&self.name)))
            .collect())
    }
}
