//! Cache tier: a bounded, concurrently shared map of recent memories.
//!
//! - [`CacheLayer`]: store/retrieve, eviction, promotion detection
//! - [`PromotionBus`]: subscription point for promoted entries
//! - [`CachePersistence`]: best-effort snapshot mirror

pub mod entry;
pub mod layer;
pub mod persist;
pub mod promotion;

pub use entry::CacheEntry;
pub use layer::{CacheLayer, CacheStats, HotEntry, PatternAnalysis, HOT_ENTRY_LIMIT};
pub use persist::{CachePersistence, SNAPSHOT_VERSION};
pub use promotion::{FnHandler, PromotionBus, PromotionHandler};
