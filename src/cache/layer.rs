//! The cache layer: bounded in-process map with promotion detection.
//!
//! All mutations (insert, evict, access bookkeeping, promoted flag) happen
//! under one mutex, so the size bound and promote-once hold under concurrent
//! stores and retrieves. Promotion notifications and snapshot writes are
//! dispatched after the lock is released and never block the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backends::Metadata;
use crate::cache::entry::CacheEntry;
use crate::cache::persist::CachePersistence;
use crate::cache::promotion::PromotionBus;
use crate::config::CacheConfig;
use crate::error::{FailOpen, Result};
use crate::util::{content_key, content_matches};

/// Number of entries reported in `hot_entries`.
pub const HOT_ENTRY_LIMIT: usize = 10;

/// Running cache counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    /// Retrieves that found their key.
    pub hits: u64,
    /// Retrieves that did not.
    pub misses: u64,
    /// Stores that created a new entry.
    pub stores: u64,
    /// Stores whose content was already cached.
    pub deduplicated: u64,
    /// Entries removed to respect `max_size`.
    pub evictions: u64,
    /// Promotion conditions fired.
    pub promotions: u64,
    /// Sum of `size_bytes` over current entries.
    pub total_size_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One row of the hot-entry report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HotEntry {
    pub key: String,
    pub content_type: String,
    pub accesses: u64,
    pub velocity: f64,
}

/// Result of [`CacheLayer::analyze_patterns`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternAnalysis {
    /// Current number of entries.
    pub total_entries: usize,
    /// Distinct CI identifiers across all entries.
    pub unique_cis: usize,
    /// Entry count per content type.
    pub type_distribution: BTreeMap<String, usize>,
    /// Sum of access counts.
    pub total_accesses: u64,
    /// Promoted entries not yet cleared.
    pub promotion_pending: usize,
    /// Fastest-accessed entries, highest velocity first.
    pub hot_entries: Vec<HotEntry>,
    /// Counter snapshot.
    pub stats: CacheStats,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Eviction index: (access_seq, created_seq) -> key.
    order: BTreeMap<(u64, u64), String>,
    /// Logical clock; strictly increases on every store and retrieve.
    clock: u64,
    /// Bumped on every mutation; tags snapshots.
    generation: u64,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.stats.total_size_bytes += entry.size_bytes as u64;
        self.order.insert(entry.eviction_rank(), entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Remove least recently accessed entries until `len <= max_size`.
    fn evict_to(&mut self, max_size: usize) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > max_size {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.stats.total_size_bytes = self
                    .stats
                    .total_size_bytes
                    .saturating_sub(entry.size_bytes as u64);
                self.stats.evictions += 1;
                evicted.push(key);
            }
        }
        evicted
    }
}

/// Bounded in-process memory cache with frequency-based promotion.
pub struct CacheLayer {
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
    bus: PromotionBus,
    persistence: Option<Arc<CachePersistence>>,
    mirror_pending: Arc<AtomicBool>,
}

impl CacheLayer {
    /// Create a cache layer from configuration.
    ///
    /// With `persist_cache` enabled, entries from an existing snapshot are
    /// loaded (fail-open: an unreadable snapshot yields an empty cache).
    /// Invalid limits are raised to their minimum of 1.
    pub fn new(mut config: CacheConfig) -> Self {
        if !CacheConfig::is_valid_max_size(config.max_size) {
            warn!(max_size = config.max_size, "max_size below 1, using 1");
            config.max_size = 1;
        }
        if !CacheConfig::is_valid_promotion_threshold(config.promotion_threshold) {
            warn!(
                promotion_threshold = config.promotion_threshold,
                "promotion_threshold below 1, using 1"
            );
            config.promotion_threshold = 1;
        }

        let persistence = if config.persist_cache {
            match config.cache_file_path() {
                Some(path) => Some(Arc::new(CachePersistence::new(path))),
                None => {
                    warn!("persist_cache enabled but no cache file location, disabling");
                    None
                }
            }
        } else {
            None
        };

        let mut state = CacheState::default();
        if let Some(persistence) = &persistence {
            let loaded = persistence
                .load()
                .fail_open_default("loading cache snapshot");
            restore_entries(&mut state, loaded);
            state.evict_to(config.max_size);
            if !state.entries.is_empty() {
                info!(
                    entries = state.entries.len(),
                    path = %persistence.path().display(),
                    "loaded cache snapshot"
                );
            }
        }

        info!(
            max_size = config.max_size,
            promotion_threshold = config.promotion_threshold,
            persist = persistence.is_some(),
            "cache layer initialized"
        );

        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            bus: PromotionBus::new(),
            persistence,
            mirror_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a non-persistent cache with the given limits.
    pub fn with_limits(max_size: usize, promotion_threshold: u64) -> Self {
        Self::new(CacheConfig {
            max_size,
            promotion_threshold,
            ..CacheConfig::default()
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The promotion subscription point.
    pub fn promotions(&self) -> &PromotionBus {
        &self.bus
    }

    /// Store content and return its key.
    ///
    /// Identical content of the same type maps to the same key: storing it
    /// again only adds `ci_id` to the entry's sources. A new entry may evict
    /// the least recently accessed ones so that `len() <= max_size` holds
    /// when this returns.
    pub fn store(&self, content: Value, content_type: &str, metadata: Metadata, ci_id: &str) -> String {
        let key = content_key(&content, content_type);

        {
            let mut state = self.state.lock();
            state.generation += 1;

            if let Some(entry) = state.entries.get_mut(&key) {
                entry.ci_sources.insert(ci_id.to_string());
                state.stats.deduplicated += 1;
                debug!(key = %key, content_type, "content already cached");
            } else {
                let seq = state.tick();
                let entry = CacheEntry::new(key.clone(), content, content_type, metadata, ci_id, seq);
                debug!(key = %key, content_type, bytes = entry.size_bytes, "stored entry");
                state.insert(entry);
                state.stats.stores += 1;

                for evicted in state.evict_to(self.config.max_size) {
                    debug!(key = %evicted, "evicted entry");
                }
            }
        }

        self.schedule_mirror();
        key
    }

    /// Retrieve content by key on behalf of `ci_id`.
    ///
    /// `None` means the key is not cached. A hit counts as an access and may
    /// fire the promotion notification, which runs in the background.
    pub fn retrieve(&self, key: &str, ci_id: &str) -> Option<Value> {
        let (content, promoted) = {
            let mut state = self.state.lock();
            let seq = state.tick();

            let Some(entry) = state.entries.get_mut(key) else {
                state.stats.misses += 1;
                return None;
            };

            let old_rank = entry.eviction_rank();
            entry.touch(ci_id, seq);
            let new_rank = entry.eviction_rank();

            let should_promote = !entry.promoted
                && (entry.access_count >= self.config.promotion_threshold
                    || (self.config.multi_ci_promotion && entry.ci_sources.len() >= 2));
            if should_promote {
                entry.promoted = true;
            }

            let content = entry.content.clone();
            let promoted = should_promote.then(|| entry.clone());

            state.order.remove(&old_rank);
            state.order.insert(new_rank, key.to_string());
            state.stats.hits += 1;
            state.generation += 1;
            if promoted.is_some() {
                state.stats.promotions += 1;
            }

            (content, promoted)
        };

        if let Some(entry) = promoted {
            info!(
                key = %entry.key,
                accesses = entry.access_count,
                cis = entry.ci_sources.len(),
                "entry promoted"
            );
            self.bus.dispatch(entry);
        }

        Some(content)
    }

    /// Promoted entries still awaiting a consumer.
    pub fn get_promotion_candidates(&self) -> Vec<CacheEntry> {
        let state = self.state.lock();
        let mut candidates: Vec<CacheEntry> = state
            .entries
            .values()
            .filter(|e| e.is_promotion_candidate())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.key.cmp(&b.key));
        candidates
    }

    /// Mark promoted entries as handled.
    ///
    /// They drop out of [`get_promotion_candidates`](Self::get_promotion_candidates)
    /// but keep their `promoted` flag and never fire again.
    pub fn clear_promoted(&self, keys: &[String]) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(entry) = state.entries.get_mut(key) {
                entry.promotion_cleared = true;
            }
        }
        state.generation += 1;
    }

    /// Summarize the current cache contents.
    pub fn analyze_patterns(&self) -> PatternAnalysis {
        let state = self.state.lock();

        let mut unique_cis: BTreeSet<&str> = BTreeSet::new();
        let mut type_distribution: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_accesses = 0;
        let mut promotion_pending = 0;

        for entry in state.entries.values() {
            unique_cis.extend(entry.ci_sources.iter().map(String::as_str));
            *type_distribution
                .entry(entry.content_type.clone())
                .or_insert(0) += 1;
            total_accesses += entry.access_count;
            if entry.is_promotion_candidate() {
                promotion_pending += 1;
            }
        }

        let mut hot: Vec<&CacheEntry> = state.entries.values().collect();
        hot.sort_by(|a, b| {
            b.access_velocity()
                .partial_cmp(&a.access_velocity())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.access_count.cmp(&a.access_count))
                .then_with(|| a.key.cmp(&b.key))
        });
        let hot_entries = hot
            .into_iter()
            .take(HOT_ENTRY_LIMIT)
            .map(|e| HotEntry {
                key: e.key.clone(),
                content_type: e.content_type.clone(),
                accesses: e.access_count,
                velocity: e.access_velocity(),
            })
            .collect();

        PatternAnalysis {
            total_entries: state.entries.len(),
            unique_cis: unique_cis.len(),
            type_distribution,
            total_accesses,
            promotion_pending,
            hot_entries,
            stats: state.stats.clone(),
        }
    }

    /// Case-insensitive substring search over cached content.
    ///
    /// Introspection only: matches are not counted as accesses. Results are
    /// ordered most recently accessed first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<CacheEntry> {
        let needle = query.to_lowercase();
        let state = self.state.lock();

        state
            .order
            .values()
            .rev()
            .filter_map(|key| state.entries.get(key))
            .filter(|e| content_matches(&e.content, &needle))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Snapshot of one entry without touching its access bookkeeping.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Check if a key is cached.
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }

    /// Write a final snapshot synchronously when persistence is enabled.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            let (entries, generation) = snapshot(&self.state);
            persistence.save(entries, generation)?;
            info!(path = %persistence.path().display(), "cache layer shutdown complete");
        }
        Ok(())
    }

    /// Queue a background snapshot write, coalescing bursts of stores.
    fn schedule_mirror(&self) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        if self.mirror_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.mirror_pending.store(false, Ordering::Release);
                debug!("no async runtime, skipping cache mirror");
                return;
            }
        };

        let state = Arc::clone(&self.state);
        let pending = Arc::clone(&self.mirror_pending);
        handle.spawn(async move {
            pending.store(false, Ordering::Release);
            let (entries, generation) = snapshot(&state);
            let written =
                tokio::task::spawn_blocking(move || persistence.save(entries, generation)).await;
            match written {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "cache mirror write failed"),
                Err(e) => warn!(error = %e, "cache mirror task failed"),
            }
        });
    }
}

impl std::fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLayer")
            .field("config", &self.config)
            .field("entries", &self.len())
            .field("bus", &self.bus)
            .finish()
    }
}

fn snapshot(state: &Mutex<CacheState>) -> (Vec<CacheEntry>, u64) {
    let state = state.lock();
    let entries = state
        .order
        .values()
        .filter_map(|key| state.entries.get(key))
        .cloned()
        .collect();
    (entries, state.generation)
}

/// Re-sequence loaded entries so the eviction index is strict again.
fn restore_entries(state: &mut CacheState, mut loaded: Vec<CacheEntry>) {
    loaded.sort_by(|a, b| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    for mut entry in loaded {
        if state.entries.contains_key(&entry.key) {
            continue;
        }
        let seq = state.tick();
        entry.created_seq = seq;
        entry.access_seq = seq;
        state.insert(entry);
    }
}
