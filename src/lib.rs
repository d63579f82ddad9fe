//! Engram - tiered memory engine for cognitive instances
//!
//! Engram keeps recent memories in a bounded in-process cache and promotes
//! frequently used ones to durable storage backends. Writes fan out to every
//! backend concurrently; recalls fan back in and are synthesized into one
//! answer, trading strict consistency for availability.

pub mod backends;
pub mod cache;
pub mod cli;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod util;

pub use backends::{
    BackendRegistry, FileBackend, InMemoryBackend, MemoryResponse, Metadata, SearchHit,
    StorageBackend,
};
pub use cache::{
    CacheEntry, CacheLayer, CacheStats, PatternAnalysis, PromotionBus, PromotionHandler,
};
pub use config::Config;
pub use encoder::{EncoderStats, SynthesisResult, SynthesisStatus, UniversalEncoder};
pub use engine::{ForwardToEncoder, MemoryEngine, Retrieval, RetrievalSource, SearchMatch};
pub use error::{EngramError, FailOpen, Result};

// CLI commands
pub use cli::{
    AnalyzeCommand, BackendsCommand, ConfigCommand, GetCommand, RecallCommand, SearchCommand,
    StoreCommand,
};
