//! Storage backend contract for Engram.
//!
//! Every durable store (relational, document, vector, in-memory) plugs into
//! the universal encoder through this one trait. The encoder bounds every call
//! with its own timeout, so implementations do not need one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Open key-value metadata supplied by callers. Never interpreted by the engine.
pub type Metadata = serde_json::Map<String, Value>;

/// Trait for storage backends that accept and return memories by key.
///
/// Both calls must be safe to invoke concurrently.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the backend name for logging and provenance.
    fn name(&self) -> &str;

    /// Store a value under `key`.
    ///
    /// `Ok(false)` means the backend declined the write; an `Err` means it
    /// failed. Both are reported as `false` by the encoder.
    async fn store(&self, key: &str, value: &Value, metadata: &Metadata) -> Result<bool>;

    /// Retrieve the value stored under `key`.
    ///
    /// Returns `Ok(None)` if the backend holds nothing for the key.
    async fn retrieve(&self, key: &str) -> Result<Option<MemoryResponse>>;

    /// Find up to `limit` memories whose content contains `query`,
    /// case-insensitively.
    ///
    /// Backends without query support keep this default, which finds nothing.
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    /// Health check for the backend.
    async fn ping(&self) -> bool {
        true
    }
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn store(&self, key: &str, value: &Value, metadata: &Metadata) -> Result<bool> {
        (**self).store(key, value, metadata).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<MemoryResponse>> {
        (**self).retrieve(key).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        (**self).search(query, limit).await
    }

    async fn ping(&self) -> bool {
        (**self).ping().await
    }
}

#[async_trait]
impl StorageBackend for Box<dyn StorageBackend> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn store(&self, key: &str, value: &Value, metadata: &Metadata) -> Result<bool> {
        (**self).store(key, value, metadata).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<MemoryResponse>> {
        (**self).retrieve(key).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        (**self).search(query, limit).await
    }

    async fn ping(&self) -> bool {
        (**self).ping().await
    }
}

/// A memory returned by one backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryResponse {
    /// The stored content.
    pub content: Value,
    /// Name of the backend that produced this response.
    pub source_backend: String,
    /// Seconds the retrieve took. Filled in by the encoder when left at zero.
    pub retrieval_time: f64,
    /// Backend's confidence in this answer, 0.0 to 1.0.
    pub confidence: f64,
    /// Backend-specific metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl MemoryResponse {
    /// Create a response with full confidence and no metadata.
    pub fn new(content: Value, source_backend: impl Into<String>) -> Self {
        Self {
            content,
            source_backend: source_backend.into(),
            retrieval_time: 0.0,
            confidence: 1.0,
            metadata: Metadata::new(),
        }
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Confidence clamped into [0.0, 1.0], with NaN treated as 0.0.
    pub fn normalized_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// One match returned by a backend search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    /// Key the memory is stored under.
    pub key: String,
    pub response: MemoryResponse,
}

impl SearchHit {
    pub fn new(key: impl Into<String>, response: MemoryResponse) -> Self {
        Self {
            key: key.into(),
            response,
        }
    }
}

/// Test doubles for exercising encoder failure handling.
#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::error::EngramError;
    use std::time::Duration;

    /// Always errors on both store and retrieve.
    pub struct FailingBackend {
        pub name: String,
    }

    impl FailingBackend {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for FailingBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn store(&self, _key: &str, _value: &Value, _metadata: &Metadata) -> Result<bool> {
            Err(EngramError::backend(&self.name, "connection refused"))
        }

        async fn retrieve(&self, _key: &str) -> Result<Option<MemoryResponse>> {
            Err(EngramError::backend(&self.name, "connection refused"))
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
            Err(EngramError::backend(&self.name, "connection refused"))
        }

        async fn ping(&self) -> bool {
            false
        }
    }

    /// Sleeps before answering; used to push a call past the encoder timeout.
    pub struct SlowBackend {
        pub name: String,
        pub delay: Duration,
    }

    impl SlowBackend {
        pub fn new(name: &str, delay: Duration) -> Self {
            Self {
                name: name.to_string(),
                delay,
            }
        }
    }

    #[async_trait]
    impl StorageBackend for SlowBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn store(&self, _key: &str, _value: &Value, _metadata: &Metadata) -> Result<bool> {
            tokio::time::sleep(self.delay).await;
            Ok(true)
        }

        async fn retrieve(&self, key: &str) -> Result<Option<MemoryResponse>> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(MemoryResponse::new(
                Value::String(format!("slow:{}", key)),
                &self.name,
            )))
        }

        async fn search(&self, query: &str, _limit: usize) -> Result<Vec<SearchHit>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![SearchHit::new(
                format!("slow-{}", query),
                MemoryResponse::new(Value::String(query.to_string()), &self.name),
            )])
        }
    }

    /// Accepts every write and never has anything to return.
    pub struct AbsentBackend {
        pub name: String,
    }

    impl AbsentBackend {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for AbsentBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn store(&self, _key: &str, _value: &Value, _metadata: &Metadata) -> Result<bool> {
            Ok(true)
        }

        async fn retrieve(&self, _key: &str) -> Result<Option<MemoryResponse>> {
            Ok(None)
        }
    }

    /// Returns fixed content at a fixed confidence for every key.
    pub struct FixedBackend {
        pub name: String,
        pub content: Value,
        pub confidence: f64,
    }

    impl FixedBackend {
        pub fn new(name: &str, content: Value, confidence: f64) -> Self {
            Self {
                name: name.to_string(),
                content,
                confidence,
            }
        }
    }

    #[async_trait]
    impl StorageBackend for FixedBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn store(&self, _key: &str, _value: &Value, _metadata: &Metadata) -> Result<bool> {
            Ok(false)
        }

        async fn retrieve(&self, _key: &str) -> Result<Option<MemoryResponse>> {
            Ok(Some(
                MemoryResponse::new(self.content.clone(), &self.name)
                    .with_confidence(self.confidence),
            ))
        }
    }

    #[test]
    fn test_normalized_confidence() {
        let r = MemoryResponse::new(Value::Null, "x");
        assert_eq!(r.clone().with_confidence(1.7).normalized_confidence(), 1.0);
        assert_eq!(r.clone().with_confidence(-0.2).normalized_confidence(), 0.0);
        assert_eq!(r.clone().with_confidence(f64::NAN).normalized_confidence(), 0.0);
        assert_eq!(r.with_confidence(0.4).normalized_confidence(), 0.4);
    }

    #[tokio::test]
    async fn test_arc_and_box_delegate() {
        let arc: Arc<dyn StorageBackend> = Arc::new(AbsentBackend::new("absent"));
        assert_eq!(StorageBackend::name(&arc), "absent");
        assert!(arc.retrieve("k").await.unwrap().is_none());

        assert!(arc.search("anything", 10).await.unwrap().is_empty());

        let boxed: Box<dyn StorageBackend> = Box::new(FailingBackend::new("down"));
        assert_eq!(boxed.name(), "down");
        assert!(!boxed.ping().await);
        assert!(boxed.search("anything", 10).await.is_err());
        assert!(boxed.store("k", &Value::Null, &Metadata::new()).await.is_err());
    }
}
