//! Storage backends for Engram.
//!
//! This module provides the contract every durable store satisfies plus the
//! built-in implementations:
//! - **Memory**: in-process map (default)
//! - **File**: one JSON document per key in a directory
//!
//! Relational, document, and vector stores live outside this crate and plug in
//! through [`StorageBackend`].

pub mod file;
pub mod memory;
pub mod registry;
pub mod traits;

pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use registry::{BackendRegistry, RegisteredBackend};
pub use traits::{MemoryResponse, Metadata, SearchHit, StorageBackend};
