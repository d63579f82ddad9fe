//! Get command for Engram.
//!
//! Looks a key up in the cache, falling back to backend recall on a miss.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cli::{to_json, DEFAULT_CI};
use crate::engine::{MemoryEngine, RetrievalSource};

/// Options for the get command.
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Retrieving CI.
    pub ci: String,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            json: false,
            quiet: false,
            ci: DEFAULT_CI.to_string(),
        }
    }
}

/// Output format for the get command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetOutput {
    /// Whether the key was found in either tier.
    pub found: bool,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<RetrievalSource>,
    /// Backends that answered, for backend hits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Cache key the recalled content now lives under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_as: Option<String>,
    /// Access count after this lookup, for cache hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_count: Option<u64>,
    /// Whether the entry is promoted.
    pub promoted: bool,
}

/// The get command implementation.
pub struct GetCommand {
    engine: Arc<MemoryEngine>,
}

impl GetCommand {
    /// Create a new get command.
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    /// Run the get command.
    pub async fn run(&self, key: &str, options: &GetOptions) -> GetOutput {
        let Some(retrieval) = self.engine.retrieve_or_recall(key, &options.ci).await else {
            return GetOutput {
                found: false,
                key: key.to_string(),
                content: None,
                source: None,
                sources: Vec::new(),
                cached_as: None,
                access_count: None,
                promoted: false,
            };
        };

        let entry = self.engine.cache().get_entry(key);
        GetOutput {
            found: true,
            key: key.to_string(),
            content: Some(retrieval.content),
            source: Some(retrieval.source),
            sources: retrieval.sources,
            cached_as: retrieval.cached_as,
            access_count: entry.as_ref().map(|e| e.access_count),
            promoted: entry.is_some_and(|e| e.promoted),
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &GetOutput, options: &GetOptions) -> String {
        if options.quiet {
            return String::new();
        }
        if options.json {
            return to_json(output);
        }

        let Some(content) = &output.content else {
            return format!("Not found: {}\n", output.key);
        };

        let mut lines = vec![crate::util::canonical_content(content), String::new()];
        match output.source {
            Some(RetrievalSource::Backends) => {
                lines.push(format!("Recalled from: {}", output.sources.join(", ")));
                if let Some(cached_as) = &output.cached_as {
                    lines.push(format!("Cached as: {}", cached_as));
                }
            }
            _ => {
                let accesses = output.access_count.unwrap_or_default();
                let promoted = if output.promoted { ", promoted" } else { "" };
                lines.push(format!("From cache ({} accesses{})", accesses, promoted));
            }
        }
        lines.join("\n") + "\n"
    }
}
