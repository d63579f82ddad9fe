//! The engine handle wiring the cache tier to the universal encoder.
//!
//! A [`MemoryEngine`] is constructed once at startup and shared by `Arc`.
//! The cache never calls the encoder; promoted entries reach the backends
//! only through a [`ForwardToEncoder`] subscription on the promotion bus.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backends::Metadata;
use crate::cache::{CacheEntry, CacheLayer, PatternAnalysis, PromotionHandler};
use crate::config::Config;
use crate::encoder::{EncoderStats, SynthesisResult, UniversalEncoder};
use crate::error::{EngramError, Result};

/// Content type under which recalled memories are cached.
pub const RECALLED_CONTENT_TYPE: &str = "recalled_memory";

/// Promotion subscriber that replicates promoted entries to every backend.
pub struct ForwardToEncoder {
    encoder: Arc<UniversalEncoder>,
}

impl ForwardToEncoder {
    pub fn new(encoder: Arc<UniversalEncoder>) -> Self {
        Self { encoder }
    }

    /// Entry metadata plus the cache-side facts backends may want to index.
    fn metadata_for(entry: &CacheEntry) -> Metadata {
        let mut metadata = entry.metadata.clone();
        metadata.insert("content_type".into(), json!(entry.content_type));
        metadata.insert("created_at".into(), json!(entry.created_at.to_rfc3339()));
        metadata.insert("access_count".into(), json!(entry.access_count));
        metadata.insert("ci_sources".into(), json!(entry.ci_sources));
        metadata
    }
}

#[async_trait]
impl PromotionHandler for ForwardToEncoder {
    async fn on_promotion(&self, entry: &CacheEntry) -> Result<()> {
        let metadata = Self::metadata_for(entry);
        let results = self
            .encoder
            .store_everywhere(&entry.key, &entry.content, &metadata)
            .await;

        let stored = results.values().filter(|ok| **ok).count();
        if stored == 0 && !results.is_empty() {
            return Err(EngramError::promotion(format!(
                "no backend accepted promoted entry '{}'",
                entry.key
            )));
        }
        info!(key = %entry.key, stored, total = results.len(), "promoted entry forwarded");
        Ok(())
    }
}

/// Where a retrieved memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Cache,
    Backends,
}

/// A memory found by [`MemoryEngine::retrieve_or_recall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    pub content: Value,
    pub source: RetrievalSource,
    /// Backends that contributed, empty for cache hits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Cache key the recalled content was stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_as: Option<String>,
}

/// A memory found by [`MemoryEngine::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub key: String,
    pub content: Value,
    pub source: RetrievalSource,
    /// Backend that held the memory, for backend matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    stores: AtomicU64,
    retrievals: AtomicU64,
    cache_hits: AtomicU64,
    backend_hits: AtomicU64,
    misses: AtomicU64,
    searches: AtomicU64,
}

/// Snapshot of engine-level counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCounts {
    pub stores: u64,
    pub retrievals: u64,
    pub cache_hits: u64,
    pub backend_hits: u64,
    pub misses: u64,
    #[serde(default)]
    pub searches: u64,
}

/// Combined statistics of both tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub engine: EngineCounts,
    pub cache: PatternAnalysis,
    pub encoder: EncoderStats,
}

/// Explicitly constructed handle over the cache tier and the encoder.
pub struct MemoryEngine {
    cache: Arc<CacheLayer>,
    encoder: Arc<UniversalEncoder>,
    queue_capacity: usize,
    counters: EngineCounters,
}

impl MemoryEngine {
    /// Build both tiers from configuration.
    ///
    /// Fails only when the backend set cannot be constructed.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(CacheLayer::new(config.cache.clone()));
        let encoder = Arc::new(UniversalEncoder::from_config(&config.encoder)?);

        let mut engine = Self::with_parts(cache, encoder);
        engine.queue_capacity = config.promotion.queue_capacity;
        if config.promotion.forward_to_backends {
            engine.forward_promotions();
        }
        Ok(engine)
    }

    /// Assemble an engine from existing parts. No promotion wiring is added.
    pub fn with_parts(cache: Arc<CacheLayer>, encoder: Arc<UniversalEncoder>) -> Self {
        Self {
            cache,
            encoder,
            queue_capacity: crate::config::PromotionConfig::default().queue_capacity,
            counters: EngineCounters::default(),
        }
    }

    /// Subscribe a [`ForwardToEncoder`] handler to the cache's promotions.
    pub fn forward_promotions(&self) {
        self.cache
            .promotions()
            .subscribe(Arc::new(ForwardToEncoder::new(Arc::clone(&self.encoder))));
        debug!("promotions forwarded to encoder");
    }

    /// Receive promoted entries on a bounded channel.
    pub fn subscribe_promotions(&self) -> mpsc::Receiver<CacheEntry> {
        self.cache.promotions().subscribe_channel(self.queue_capacity)
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn encoder(&self) -> &Arc<UniversalEncoder> {
        &self.encoder
    }

    /// Store content in the cache tier and return its key.
    pub fn store(&self, content: Value, content_type: &str, metadata: Metadata, ci_id: &str) -> String {
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        self.cache.store(content, content_type, metadata, ci_id)
    }

    /// Retrieve content from the cache tier only.
    pub fn retrieve(&self, key: &str, ci_id: &str) -> Option<Value> {
        self.counters.retrievals.fetch_add(1, Ordering::Relaxed);
        let found = self.cache.retrieve(key, ci_id);
        let counter = if found.is_some() {
            &self.counters.cache_hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Retrieve from the cache, recalling from backends on a miss.
    ///
    /// Recalled content is cached as `recalled_memory` so later lookups by
    /// its own key stay local.
    pub async fn retrieve_or_recall(&self, key: &str, ci_id: &str) -> Option<Retrieval> {
        self.counters.retrievals.fetch_add(1, Ordering::Relaxed);

        if let Some(content) = self.cache.retrieve(key, ci_id) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(Retrieval {
                content,
                source: RetrievalSource::Cache,
                sources: Vec::new(),
                cached_as: None,
            });
        }

        let recalled = self.encoder.recall_from_everywhere(key).await;
        let Some(content) = recalled.content else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "not found in cache or backends");
            return None;
        };

        self.counters.backend_hits.fetch_add(1, Ordering::Relaxed);
        let mut metadata = Metadata::new();
        metadata.insert("synthesis".into(), Value::Bool(true));
        let cached_as = self
            .cache
            .store(content.clone(), RECALLED_CONTENT_TYPE, metadata, ci_id);

        Some(Retrieval {
            content,
            source: RetrievalSource::Backends,
            sources: recalled.sources,
            cached_as: Some(cached_as),
        })
    }

    /// Find up to `limit` memories whose content contains `query`.
    ///
    /// The cache is searched first, most recently used entries leading. Only
    /// when it yields fewer than `limit` matches are the backends searched,
    /// under the encoder's per-backend timeout, to fill the rest. Keys already
    /// matched in the cache are not repeated. Searching never counts as an
    /// access.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchMatch> {
        self.counters.searches.fetch_add(1, Ordering::Relaxed);

        let mut matches: Vec<SearchMatch> = self
            .cache
            .search(query, limit)
            .into_iter()
            .map(|entry| SearchMatch {
                key: entry.key,
                content: entry.content,
                source: RetrievalSource::Cache,
                backend: None,
            })
            .collect();
        if matches.len() >= limit {
            return matches;
        }

        let remaining = limit - matches.len();
        let cached: HashSet<String> = matches.iter().map(|m| m.key.clone()).collect();
        // Backends may hold the cached matches too, so ask for the full limit.
        let hits = self.encoder.search_everywhere(query, limit).await;
        matches.extend(
            hits.into_iter()
                .filter(|hit| !cached.contains(&hit.key))
                .take(remaining)
                .map(|hit| SearchMatch {
                    key: hit.key,
                    content: hit.response.content,
                    source: RetrievalSource::Backends,
                    backend: Some(hit.response.source_backend),
                }),
        );

        debug!(query, found = matches.len(), "search finished");
        matches
    }

    /// Replicate a value to every backend.
    pub async fn store_everywhere(
        &self,
        key: &str,
        value: &Value,
        metadata: &Metadata,
    ) -> BTreeMap<String, bool> {
        self.encoder.store_everywhere(key, value, metadata).await
    }

    /// Recall a key from every backend and synthesize one answer.
    pub async fn recall_from_everywhere(&self, key: &str) -> SynthesisResult {
        self.encoder.recall_from_everywhere(key).await
    }

    pub fn analyze_patterns(&self) -> PatternAnalysis {
        self.cache.analyze_patterns()
    }

    pub fn get_promotion_candidates(&self) -> Vec<CacheEntry> {
        self.cache.get_promotion_candidates()
    }

    pub fn clear_promoted(&self, keys: &[String]) {
        self.cache.clear_promoted(keys)
    }

    /// Counters of the engine and both tiers.
    pub fn statistics(&self) -> EngineStatistics {
        let c = &self.counters;
        EngineStatistics {
            engine: EngineCounts {
                stores: c.stores.load(Ordering::Relaxed),
                retrievals: c.retrievals.load(Ordering::Relaxed),
                cache_hits: c.cache_hits.load(Ordering::Relaxed),
                backend_hits: c.backend_hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
                searches: c.searches.load(Ordering::Relaxed),
            },
            cache: self.cache.analyze_patterns(),
            encoder: self.encoder.statistics(),
        }
    }

    /// Wait until promotion notifications dispatched so far have run.
    pub async fn flush_promotions(&self) {
        self.cache.promotions().flush().await
    }

    /// Persist the cache snapshot when persistence is enabled.
    pub fn shutdown(&self) -> Result<()> {
        self.cache.shutdown()
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("cache", &self.cache)
            .field("encoder", &self.encoder)
            .finish()
    }
}
