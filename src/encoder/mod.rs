//! Universal encoder: concurrent fan-out writes and fan-in recall.
//!
//! Every backend call runs in its own task under its own timeout. A failing
//! or hung backend only costs its own slot in the result; the call as a whole
//! returns once the slowest bounded task has finished.

pub mod synthesis;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backends::{BackendRegistry, MemoryResponse, Metadata, SearchHit};
use crate::config::EncoderConfig;
use crate::error::{EngramError, Result};

pub use synthesis::{synthesize, Outlier, SynthesisResult, SynthesisStatus};

/// Per-backend call counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub stores: u64,
    pub store_failures: u64,
    pub recalls: u64,
    pub recall_hits: u64,
    pub recall_timeouts: u64,
    pub recall_failures: u64,
    #[serde(default)]
    pub searches: u64,
    /// Searches that failed or timed out.
    #[serde(default)]
    pub search_failures: u64,
}

impl BackendStats {
    /// Share of calls that did not fail or time out (1.0 when idle).
    pub fn success_rate(&self) -> f64 {
        let calls = self.stores + self.recalls + self.searches;
        if calls == 0 {
            return 1.0;
        }
        let failed = self.store_failures
            + self.recall_failures
            + self.recall_timeouts
            + self.search_failures;
        (calls.saturating_sub(failed)) as f64 / calls as f64
    }
}

/// Encoder counters, keyed by backend name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderStats {
    pub backends: BTreeMap<String, BackendStats>,
    pub store_calls: u64,
    pub recall_calls: u64,
    pub no_memories: u64,
    #[serde(default)]
    pub search_calls: u64,
}

impl EncoderStats {
    /// Success rate of one backend, if it is known.
    pub fn success_rate(&self, backend: &str) -> Option<f64> {
        self.backends.get(backend).map(BackendStats::success_rate)
    }
}

/// How a single backend call ended.
enum CallOutcome<T> {
    Done(T),
    Failed(EngramError),
}

/// Fans memories out to every registered backend and merges them back.
pub struct UniversalEncoder {
    registry: BackendRegistry,
    timeout: Duration,
    stats: Mutex<EncoderStats>,
}

impl UniversalEncoder {
    /// Create an encoder over a fixed backend registry.
    pub fn new(registry: BackendRegistry, timeout: Duration) -> Self {
        let mut stats = EncoderStats::default();
        for name in registry.names() {
            stats.backends.insert(name, BackendStats::default());
        }
        info!(
            backends = ?registry.names(),
            timeout_ms = timeout.as_millis() as u64,
            "universal encoder initialized"
        );
        Self {
            registry,
            timeout,
            stats: Mutex::new(stats),
        }
    }

    /// Build the registry and timeout from configuration.
    pub fn from_config(config: &EncoderConfig) -> Result<Self> {
        let registry = BackendRegistry::from_config(config)?;
        Ok(Self::new(registry, config.backend_timeout()))
    }

    /// Per-backend call bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The backend registry.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Backend names in priority order.
    pub fn backend_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Write `value` under `key` to every backend concurrently.
    ///
    /// Each backend maps to `true` only if it accepted the write in time.
    /// Nothing is rolled back when some backends fail.
    pub async fn store_everywhere(
        &self,
        key: &str,
        value: &Value,
        metadata: &Metadata,
    ) -> BTreeMap<String, bool> {
        let calls = self.registry.iter().map(|registered| {
            let backend = Arc::clone(&registered.backend);
            let key = key.to_string();
            let value = value.clone();
            let metadata = metadata.clone();
            let name = registered.name.clone();
            let timeout = self.timeout;
            async move {
                let outcome = bounded(&name, timeout, async move {
                    backend.store(&key, &value, &metadata).await
                })
                .await;
                (name, outcome)
            }
        });

        let outcomes = join_all(calls).await;

        let mut results = BTreeMap::new();
        let mut stats = self.stats.lock();
        stats.store_calls += 1;
        for (name, outcome) in outcomes {
            let slot = stats.backends.entry(name.clone()).or_default();
            slot.stores += 1;
            let stored = match outcome {
                CallOutcome::Done(accepted) => {
                    if !accepted {
                        debug!(backend = %name, key, "backend declined write");
                    }
                    accepted
                }
                CallOutcome::Failed(e) => {
                    slot.store_failures += 1;
                    log_failure(&name, key, &e, "store");
                    false
                }
            };
            results.insert(name, stored);
        }
        drop(stats);

        debug!(
            key,
            stored = results.values().filter(|ok| **ok).count(),
            total = results.len(),
            "store_everywhere finished"
        );
        results
    }

    /// Read `key` from every backend concurrently and synthesize one answer.
    pub async fn recall_from_everywhere(&self, key: &str) -> SynthesisResult {
        let calls = self.registry.iter().map(|registered| {
            let backend = Arc::clone(&registered.backend);
            let key = key.to_string();
            let name = registered.name.clone();
            let timeout = self.timeout;
            async move {
                let started = Instant::now();
                let outcome =
                    bounded(&name, timeout, async move { backend.retrieve(&key).await }).await;
                (name, started.elapsed(), outcome)
            }
        });

        let outcomes = join_all(calls).await;

        let mut responses = Vec::new();
        let mut stats = self.stats.lock();
        stats.recall_calls += 1;
        for (name, elapsed, outcome) in outcomes {
            let slot = stats.backends.entry(name.clone()).or_default();
            slot.recalls += 1;
            match outcome {
                CallOutcome::Done(Some(response)) => {
                    slot.recall_hits += 1;
                    responses.push(stamp(response, &name, elapsed));
                }
                CallOutcome::Done(None) => {
                    debug!(backend = %name, key, "backend has no memory for key");
                }
                CallOutcome::Failed(e) => {
                    if matches!(e, EngramError::BackendTimeout { .. }) {
                        slot.recall_timeouts += 1;
                    } else {
                        slot.recall_failures += 1;
                    }
                    log_failure(&name, key, &e, "recall");
                }
            }
        }

        let result = synthesize(responses, self.registry.len());
        if !result.found() {
            stats.no_memories += 1;
        }
        drop(stats);

        debug!(
            key,
            status = %result.status,
            sources = result.sources.len(),
            "recall_from_everywhere finished"
        );
        result
    }

    /// Search every backend concurrently for content containing `query`.
    ///
    /// Each backend is asked for up to `limit` matches under the usual timeout.
    /// Hits are merged in registration order and deduplicated by key, so a
    /// memory held by several backends is reported once, attributed to the
    /// highest-priority holder. Failed or hung backends contribute nothing.
    pub async fn search_everywhere(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        if limit == 0 {
            return Vec::new();
        }

        let calls = self.registry.iter().map(|registered| {
            let backend = Arc::clone(&registered.backend);
            let query = query.to_string();
            let name = registered.name.clone();
            let timeout = self.timeout;
            async move {
                let started = Instant::now();
                let outcome = bounded(&name, timeout, async move {
                    backend.search(&query, limit).await
                })
                .await;
                (name, started.elapsed(), outcome)
            }
        });

        let outcomes = join_all(calls).await;

        let mut seen = std::collections::HashSet::new();
        let mut hits = Vec::new();
        let mut stats = self.stats.lock();
        stats.search_calls += 1;
        for (name, elapsed, outcome) in outcomes {
            let slot = stats.backends.entry(name.clone()).or_default();
            slot.searches += 1;
            match outcome {
                CallOutcome::Done(found) => {
                    for hit in found.into_iter().take(limit) {
                        if seen.insert(hit.key.clone()) {
                            hits.push(SearchHit {
                                key: hit.key,
                                response: stamp(hit.response, &name, elapsed),
                            });
                        }
                    }
                }
                CallOutcome::Failed(e) => {
                    slot.search_failures += 1;
                    log_failure(&name, query, &e, "search");
                }
            }
        }
        drop(stats);

        hits.truncate(limit);
        debug!(query, hits = hits.len(), "search_everywhere finished");
        hits
    }

    /// Ping every backend concurrently, in priority order.
    pub async fn ping_all(&self) -> Vec<(String, bool)> {
        let pings = self.registry.iter().map(|registered| {
            let backend = Arc::clone(&registered.backend);
            let name = registered.name.clone();
            let timeout = self.timeout;
            async move {
                let healthy = tokio::time::timeout(timeout, backend.ping())
                    .await
                    .unwrap_or(false);
                (name, healthy)
            }
        });
        join_all(pings).await
    }

    /// Snapshot of call counters.
    pub fn statistics(&self) -> EncoderStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for UniversalEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalEncoder")
            .field("backends", &self.registry.names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Run one backend call in its own task, bounded by `timeout`.
async fn bounded<T, F>(name: &str, timeout: Duration, call: F) -> CallOutcome<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let task = tokio::spawn(tokio::time::timeout(timeout, call));
    match task.await {
        Ok(Ok(Ok(value))) => CallOutcome::Done(value),
        Ok(Ok(Err(e))) => CallOutcome::Failed(e),
        Ok(Err(_elapsed)) => {
            CallOutcome::Failed(EngramError::backend_timeout(name, timeout.as_millis() as u64))
        }
        Err(join_error) => CallOutcome::Failed(EngramError::backend(
            name,
            format!("backend task aborted: {}", join_error),
        )),
    }
}

/// Timeouts log at warn, other backend errors at debug.
///
/// `target` is the key, or the query for searches.
fn log_failure(backend: &str, target: &str, error: &EngramError, op: &str) {
    if matches!(error, EngramError::BackendTimeout { .. }) {
        warn!(backend, target, op, error = %error, "backend call timed out");
    } else {
        debug!(backend, target, op, error = %error, "backend call failed");
    }
}

/// Attribute a response to its registry name and fill in missing timing.
fn stamp(mut response: MemoryResponse, name: &str, elapsed: Duration) -> MemoryResponse {
    response.source_backend = name.to_string();
    if response.retrieval_time <= 0.0 {
        response.retrieval_time = elapsed.as_secs_f64();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::traits::tests::{AbsentBackend, FailingBackend, FixedBackend, SlowBackend};
    use crate::backends::InMemoryBackend;
    use crate::backends::StorageBackend;
    use serde_json::json;

    fn encoder(backends: Vec<Arc<dyn StorageBackend>>, timeout_ms: u64) -> UniversalEncoder {
        let mut registry = BackendRegistry::new();
        for backend in backends {
            registry.register(backend).unwrap();
        }
        UniversalEncoder::new(registry, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_store_everywhere_partial_failure() {
        let encoder = encoder(
            vec![
                Arc::new(InMemoryBackend::new("a")),
                Arc::new(FailingBackend::new("b")),
                Arc::new(InMemoryBackend::new("c")),
            ],
            500,
        );

        let results = encoder
            .store_everywhere("k", &json!("v"), &Metadata::new())
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.values().filter(|ok| **ok).count(), 2);
        assert_eq!(results["b"], false);

        let stats = encoder.statistics();
        assert_eq!(stats.backends["b"].store_failures, 1);
        assert_eq!(stats.success_rate("a"), Some(1.0));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out_without_delaying_others() {
        let encoder = encoder(
            vec![
                Arc::new(InMemoryBackend::new("fast")),
                Arc::new(SlowBackend::new("slow", Duration::from_secs(5))),
            ],
            100,
        );

        let started = Instant::now();
        let results = encoder
            .store_everywhere("k", &json!("v"), &Metadata::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results["fast"], true);
        assert_eq!(results["slow"], false);
    }

    #[tokio::test]
    async fn test_recall_no_memories() {
        let encoder = encoder(
            vec![
                Arc::new(AbsentBackend::new("a")),
                Arc::new(AbsentBackend::new("b")),
            ],
            500,
        );

        let result = encoder.recall_from_everywhere("missing").await;
        assert_eq!(result.status, SynthesisStatus::NoMemories);
        assert!(result.content.is_none());
        assert_eq!(encoder.statistics().no_memories, 1);
    }

    #[tokio::test]
    async fn test_recall_partial_success() {
        let encoder = encoder(
            vec![
                Arc::new(FixedBackend::new("a", json!("memory"), 0.8)),
                Arc::new(FailingBackend::new("b")),
                Arc::new(FixedBackend::new("c", json!("memory"), 0.8)),
            ],
            500,
        );

        let result = encoder.recall_from_everywhere("k").await;
        assert_eq!(result.status, SynthesisStatus::Partial);
        assert_eq!(result.sources, vec!["a", "c"]);
        assert_eq!(result.primary_source.as_deref(), Some("a"));
        assert!(result.consensus);
    }

    #[tokio::test]
    async fn test_recall_timeout_is_counted() {
        let encoder = encoder(
            vec![
                Arc::new(FixedBackend::new("fixed", json!("x"), 0.5)),
                Arc::new(SlowBackend::new("slow", Duration::from_secs(5))),
            ],
            50,
        );

        let result = encoder.recall_from_everywhere("k").await;
        assert_eq!(result.sources, vec!["fixed"]);
        assert_eq!(encoder.statistics().backends["slow"].recall_timeouts, 1);
    }

    #[tokio::test]
    async fn test_roundtrip_fills_retrieval_time() {
        let encoder = encoder(vec![Arc::new(InMemoryBackend::new("mem"))], 500);
        encoder
            .store_everywhere("k", &json!({"a": 1}), &Metadata::new())
            .await;

        let result = encoder.recall_from_everywhere("k").await;
        assert_eq!(result.status, SynthesisStatus::Success);
        assert_eq!(result.content, Some(json!({"a": 1})));
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_stamp_sets_registry_name_and_time() {
        let response = MemoryResponse::new(json!(1), "inner");
        let stamped = stamp(response, "outer", Duration::from_millis(20));
        assert_eq!(stamped.source_backend, "outer");
        assert!(stamped.retrieval_time >= 0.02);
    }

    #[tokio::test]
    async fn test_ping_all_in_priority_order() {
        let encoder = encoder(
            vec![
                Arc::new(InMemoryBackend::new("up")),
                Arc::new(FailingBackend::new("down")),
            ],
            500,
        );
        let health = encoder.ping_all().await;
        assert_eq!(
            health,
            vec![("up".to_string(), true), ("down".to_string(), false)]
        );
        assert_eq!(encoder.backend_names(), vec!["up", "down"]);
    }

    #[tokio::test]
    async fn test_search_everywhere_merges_in_priority_order() {
        let first = Arc::new(InMemoryBackend::new("first"));
        let second = Arc::new(InMemoryBackend::new("second"));
        first.store("shared", &json!("free as in beer"), &Metadata::new()).await.unwrap();
        second.store("shared", &json!("free as in beer"), &Metadata::new()).await.unwrap();
        second.store("only-second", &json!("free speech"), &Metadata::new()).await.unwrap();

        let encoder = encoder(
            vec![
                first as Arc<dyn StorageBackend>,
                Arc::new(FailingBackend::new("down")),
                second as Arc<dyn StorageBackend>,
                Arc::new(SlowBackend::new("slow", Duration::from_secs(5))),
            ],
            100,
        );

        let started = Instant::now();
        let hits = encoder.search_everywhere("FREE", 10).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        let found: Vec<(&str, &str)> = hits
            .iter()
            .map(|h| (h.key.as_str(), h.response.source_backend.as_str()))
            .collect();
        assert_eq!(found, vec![("shared", "first"), ("only-second", "second")]);

        let stats = encoder.statistics();
        assert_eq!(stats.search_calls, 1);
        assert_eq!(stats.backends["down"].search_failures, 1);
        assert_eq!(stats.backends["slow"].search_failures, 1);
        assert_eq!(stats.backends["first"].search_failures, 0);

        assert_eq!(encoder.search_everywhere("free", 1).await.len(), 1);
        assert!(encoder.search_everywhere("free", 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let encoder = encoder(Vec::new(), 100);
        assert!(encoder
            .store_everywhere("k", &json!(1), &Metadata::new())
            .await
            .is_empty());
        assert!(!encoder.recall_from_everywhere("k").await.found());
    }
}
