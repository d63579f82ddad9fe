//! Search command for Engram.
//!
//! Finds memories by content, in the cache first and then in the backends.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cli::{preview, to_json};
use crate::engine::{MemoryEngine, RetrievalSource, SearchMatch};

/// Default number of results.
pub const DEFAULT_LIMIT: usize = 10;

/// Options for the search command.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Maximum number of results.
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            json: false,
            quiet: false,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Output format for the search command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutput {
    pub query: String,
    pub results: Vec<SearchMatch>,
}

impl SearchOutput {
    pub fn found(&self) -> bool {
        !self.results.is_empty()
    }
}

/// The search command implementation.
pub struct SearchCommand {
    engine: Arc<MemoryEngine>,
}

impl SearchCommand {
    /// Create a new search command.
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    /// Run the search command.
    pub async fn run(&self, query: &str, options: &SearchOptions) -> SearchOutput {
        SearchOutput {
            query: query.to_string(),
            results: self.engine.search(query, options.limit).await,
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &SearchOutput, options: &SearchOptions) -> String {
        if options.quiet {
            return String::new();
        }
        if options.json {
            return to_json(output);
        }
        if output.results.is_empty() {
            return format!("No memories match '{}'\n", output.query);
        }

        let mut lines = Vec::new();
        for m in &output.results {
            let origin = match (&m.source, &m.backend) {
                (RetrievalSource::Backends, Some(backend)) => backend.as_str(),
                _ => "cache",
            };
            lines.push(format!("{}  [{}]  {}", m.key, origin, preview(&m.content, 60)));
        }
        lines.join("\n") + "\n"
    }
}
