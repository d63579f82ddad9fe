//! Store command for Engram.
//!
//! Caches a memory and optionally replicates it to every backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backends::Metadata;
use crate::cli::{to_json, DEFAULT_CI};
use crate::engine::MemoryEngine;

/// Options for the store command.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Content type tag.
    pub content_type: String,
    /// Storing CI.
    pub ci: String,
    /// Also write to every backend.
    pub everywhere: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            json: false,
            quiet: false,
            content_type: "thought".to_string(),
            ci: DEFAULT_CI.to_string(),
            everywhere: false,
        }
    }
}

/// Output format for the store command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOutput {
    /// Whether the command was successful.
    pub success: bool,
    /// Key the content was cached under.
    pub key: String,
    pub content_type: String,
    pub ci: String,
    /// Per-backend outcome when `--everywhere` was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicated: Option<BTreeMap<String, bool>>,
}

/// The store command implementation.
pub struct StoreCommand {
    engine: Arc<MemoryEngine>,
}

impl StoreCommand {
    /// Create a new store command.
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    /// Run the store command.
    pub async fn run(&self, content: &str, metadata: Metadata, options: &StoreOptions) -> StoreOutput {
        let value = Value::String(content.to_string());
        let key = self.engine.store(
            value.clone(),
            &options.content_type,
            metadata.clone(),
            &options.ci,
        );

        let replicated = if options.everywhere {
            Some(self.engine.store_everywhere(&key, &value, &metadata).await)
        } else {
            None
        };

        StoreOutput {
            success: true,
            key,
            content_type: options.content_type.clone(),
            ci: options.ci.clone(),
            replicated,
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &StoreOutput, options: &StoreOptions) -> String {
        if options.quiet {
            return String::new();
        }
        if options.json {
            return to_json(output);
        }

        let mut lines = vec![format!(
            "Stored {} ({}, ci {})",
            output.key, output.content_type, output.ci
        )];
        if let Some(replicated) = &output.replicated {
            let ok = replicated.values().filter(|stored| **stored).count();
            lines.push(format!("Replicated to {}/{} backends:", ok, replicated.len()));
            for (name, stored) in replicated {
                let mark = if *stored { "+" } else { "-" };
                lines.push(format!("  [{}] {}", mark, name));
            }
        }
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn engine() -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine::new(&Config::default()).unwrap())
    }

    #[tokio::test]
    async fn test_store_caches_content() {
        let engine = engine();
        let cmd = StoreCommand::new(Arc::clone(&engine));
        let output = cmd
            .run("a thought", Metadata::new(), &StoreOptions::default())
            .await;

        assert!(output.success);
        assert!(output.replicated.is_none());
        assert!(engine.cache().contains(&output.key));
    }

    #[tokio::test]
    async fn test_store_everywhere_reports_backends() {
        let cmd = StoreCommand::new(engine());
        let options = StoreOptions {
            everywhere: true,
            ..StoreOptions::default()
        };
        let output = cmd.run("replicate me", Metadata::new(), &options).await;

        let replicated = output.replicated.clone().unwrap();
        assert_eq!(replicated.get("memory"), Some(&true));

        let text = cmd.format_output(&output, &options);
        assert!(text.contains("Replicated to 1/1 backends"));
    }

    #[tokio::test]
    async fn test_quiet_and_json_output() {
        let cmd = StoreCommand::new(engine());
        let output = cmd
            .run("x", Metadata::new(), &StoreOptions::default())
            .await;

        let quiet = StoreOptions {
            quiet: true,
            ..StoreOptions::default()
        };
        assert!(cmd.format_output(&output, &quiet).is_empty());

        let json = StoreOptions {
            json: true,
            ..StoreOptions::default()
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&cmd.format_output(&output, &json)).unwrap();
        assert_eq!(parsed["key"], serde_json::json!(output.key));
        assert!(parsed.get("replicated").is_none());
    }
}
