//! Recall command for Engram.
//!
//! Asks every backend for a key and prints the synthesized answer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cli::{preview, to_json};
use crate::encoder::{SynthesisResult, SynthesisStatus};
use crate::engine::MemoryEngine;

/// Options for the recall command.
#[derive(Debug, Clone, Default)]
pub struct RecallOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
}

/// Output format for the recall command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallOutput {
    pub key: String,
    /// Number of backends asked.
    pub backends: usize,
    #[serde(flatten)]
    pub result: SynthesisResult,
}

impl RecallOutput {
    /// Whether any backend had the key.
    pub fn found(&self) -> bool {
        self.result.found()
    }
}

/// The recall command implementation.
pub struct RecallCommand {
    engine: Arc<MemoryEngine>,
}

impl RecallCommand {
    /// Create a new recall command.
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    /// Run the recall command.
    pub async fn run(&self, key: &str, _options: &RecallOptions) -> RecallOutput {
        let result = self.engine.recall_from_everywhere(key).await;
        RecallOutput {
            key: key.to_string(),
            backends: self.engine.encoder().registry().len(),
            result,
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &RecallOutput, options: &RecallOptions) -> String {
        if options.quiet {
            return String::new();
        }
        if options.json {
            return to_json(output);
        }

        let result = &output.result;
        let Some(content) = &result.content else {
            return format!(
                "No memories for {} across {} backends.\n",
                output.key, output.backends
            );
        };

        let mut lines = vec![crate::util::canonical_content(content), String::new()];
        lines.push(format!(
            "Status: {} ({}/{} backends)",
            result.status,
            result.sources.len(),
            output.backends
        ));
        if let Some(primary) = &result.primary_source {
            lines.push(format!(
                "Primary: {} (confidence {:.2})",
                primary, result.confidence
            ));
        }
        if result.status == SynthesisStatus::Success && result.sources.len() > 1 {
            let agreement = if result.consensus { "agree" } else { "diverge" };
            lines.push(format!("Backends {}", agreement));
        }
        if !result.outliers.is_empty() {
            lines.push("Outliers:".to_string());
            for outlier in &result.outliers {
                lines.push(format!(
                    "  {} ({:.2}): {}",
                    outlier.source,
                    outlier.confidence,
                    preview(&outlier.content, 60)
                ));
            }
        }
        lines.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Metadata;
    use crate::config::Config;
    use serde_json::json;

    fn engine() -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine::new(&Config::default()).unwrap())
    }

    #[tokio::test]
    async fn test_recall_found() {
        let engine = engine();
        engine
            .store_everywhere("k", &json!("stored"), &Metadata::new())
            .await;
        let cmd = RecallCommand::new(engine);

        let output = cmd.run("k", &RecallOptions::default()).await;
        assert!(output.found());
        assert_eq!(output.result.status, SynthesisStatus::Success);

        let text = cmd.format_output(&output, &RecallOptions::default());
        assert!(text.contains("Status: success (1/1 backends)"));
        assert!(text.contains("Primary: memory"));
    }

    #[tokio::test]
    async fn test_recall_lists_outliers() {
        use crate::backends::{BackendRegistry, InMemoryBackend, StorageBackend};
        use crate::cache::CacheLayer;
        use crate::encoder::UniversalEncoder;
        use std::time::Duration;

        let first = Arc::new(InMemoryBackend::new("first"));
        let second = Arc::new(InMemoryBackend::new("second"));
        first.store("k", &json!("new"), &Metadata::new()).await.unwrap();
        second.store("k", &json!("old"), &Metadata::new()).await.unwrap();
        let registry = BackendRegistry::new()
            .with(first as Arc<dyn StorageBackend>)
            .unwrap()
            .with(second as Arc<dyn StorageBackend>)
            .unwrap();
        let engine = Arc::new(MemoryEngine::with_parts(
            Arc::new(CacheLayer::with_limits(10, 2)),
            Arc::new(UniversalEncoder::new(registry, Duration::from_millis(500))),
        ));
        let cmd = RecallCommand::new(engine);

        let output = cmd.run("k", &RecallOptions::default()).await;
        assert_eq!(output.result.content, Some(json!("new")));

        let text = cmd.format_output(&output, &RecallOptions::default());
        assert!(text.contains("Backends diverge"));
        assert!(text.contains("Outliers:\n  second (1.00): old"));
    }

    #[tokio::test]
    async fn test_recall_json_is_flat() {
        let cmd = RecallCommand::new(engine());
        let output = cmd.run("nothing", &RecallOptions::default()).await;
        assert!(!output.found());

        let options = RecallOptions {
            json: true,
            ..RecallOptions::default()
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&cmd.format_output(&output, &options)).unwrap();
        assert_eq!(parsed["status"], json!("no_memories"));
        assert_eq!(parsed["backends"], json!(1));
    }
}
