//! Cache entry type.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backends::Metadata;
use crate::util::canonical_content;

/// The unit of cached state.
///
/// Owned exclusively by the cache layer; callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    /// Content-addressed key assigned at store time.
    pub key: String,
    /// Opaque payload.
    pub content: Value,
    /// Classification tag ("thought", "fact", "insight", ...). Reporting only.
    pub content_type: String,
    /// Caller-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Every CI that stored or retrieved this entry. Only ever grows.
    pub ci_sources: BTreeSet<String>,
    /// Number of retrieves. Stores never count.
    pub access_count: u64,
    /// When the entry was first stored.
    pub created_at: DateTime<Utc>,
    /// Last retrieve (or creation if never retrieved).
    pub last_accessed_at: DateTime<Utc>,
    /// Set once the promotion condition fired.
    pub promoted: bool,
    /// Set by `clear_promoted` once a consumer has handled the promotion.
    #[serde(default)]
    pub promotion_cleared: bool,
    /// Length of the canonical content in bytes.
    pub size_bytes: usize,
    /// Logical clock at creation; tie-breaks eviction.
    #[serde(skip)]
    pub(crate) created_seq: u64,
    /// Logical clock at last access; primary eviction order.
    #[serde(skip)]
    pub(crate) access_seq: u64,
}

impl CacheEntry {
    pub(crate) fn new(
        key: String,
        content: Value,
        content_type: &str,
        metadata: Metadata,
        ci_id: &str,
        seq: u64,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = canonical_content(&content).len();
        let mut ci_sources = BTreeSet::new();
        ci_sources.insert(ci_id.to_string());

        Self {
            key,
            content,
            content_type: content_type.to_string(),
            metadata,
            ci_sources,
            access_count: 0,
            created_at: now,
            last_accessed_at: now,
            promoted: false,
            promotion_cleared: false,
            size_bytes,
            created_seq: seq,
            access_seq: seq,
        }
    }

    /// Record a retrieve by `ci_id`.
    pub(crate) fn touch(&mut self, ci_id: &str, seq: u64) {
        self.access_count += 1;
        self.ci_sources.insert(ci_id.to_string());
        self.last_accessed_at = Utc::now();
        self.access_seq = seq;
    }

    /// Eviction order key: oldest access first, then oldest creation.
    pub(crate) fn eviction_rank(&self) -> (u64, u64) {
        (self.access_seq, self.created_seq)
    }

    /// Whether the entry still awaits a consumer.
    pub fn is_promotion_candidate(&self) -> bool {
        self.promoted && !self.promotion_cleared
    }

    /// Accesses per hour between creation and the last access.
    pub fn access_velocity(&self) -> f64 {
        if self.access_count <= 1 {
            return 0.0;
        }
        let span_ms = (self.last_accessed_at - self.created_at).num_milliseconds();
        if span_ms <= 0 {
            return self.access_count as f64;
        }
        let hours = span_ms as f64 / 3_600_000.0;
        self.access_count as f64 / hours
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry() -> CacheEntry {
        CacheEntry::new(
            "k".to_string(),
            json!("hello"),
            "thought",
            Metadata::new(),
            "ci1",
            1,
        )
    }

    #[test]
    fn test_new_entry_has_zero_accesses() {
        let e = entry();
        assert_eq!(e.access_count, 0);
        assert_eq!(e.ci_sources.len(), 1);
        assert!(e.ci_sources.contains("ci1"));
        assert_eq!(e.created_at, e.last_accessed_at);
        assert_eq!(e.size_bytes, 5);
        assert!(!e.promoted);
    }

    #[test]
    fn test_touch_updates_counters_and_sources() {
        let mut e = entry();
        e.touch("ci2", 5);
        e.touch("ci2", 6);

        assert_eq!(e.access_count, 2);
        assert_eq!(e.ci_sources.len(), 2);
        assert_eq!(e.eviction_rank(), (6, 1));
    }

    #[test]
    fn test_access_velocity() {
        let mut e = entry();
        assert_eq!(e.access_velocity(), 0.0);

        e.access_count = 4;
        e.last_accessed_at = e.created_at + Duration::hours(2);
        assert!((e.access_velocity() - 2.0).abs() < 1e-9);

        e.last_accessed_at = e.created_at;
        assert_eq!(e.access_velocity(), 4.0);
    }

    #[test]
    fn test_snapshot_serialization_skips_clock() {
        let mut e = entry();
        e.touch("ci2", 9);
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("access_seq"));

        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access_seq, 0);
        assert_eq!(back.ci_sources, e.ci_sources);
    }
}
