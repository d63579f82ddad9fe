//! Analyze command for Engram.
//!
//! Reports cache usage patterns and promotion state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::PatternAnalysis;
use crate::cli::to_json;
use crate::engine::{EngineStatistics, MemoryEngine};

/// Options for the analyze command.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Include engine and encoder counters.
    pub detailed: bool,
}

/// Output format for the analyze command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeOutput {
    pub analysis: PatternAnalysis,
    /// Keys awaiting a promotion consumer.
    pub promotion_candidates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<EngineStatistics>,
}

/// The analyze command implementation.
pub struct AnalyzeCommand {
    engine: Arc<MemoryEngine>,
}

impl AnalyzeCommand {
    /// Create a new analyze command.
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self { engine }
    }

    /// Run the analyze command.
    pub fn run(&self, options: &AnalyzeOptions) -> AnalyzeOutput {
        let promotion_candidates = self
            .engine
            .get_promotion_candidates()
            .into_iter()
            .map(|e| e.key)
            .collect();

        AnalyzeOutput {
            analysis: self.engine.analyze_patterns(),
            promotion_candidates,
            statistics: options.detailed.then(|| self.engine.statistics()),
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &AnalyzeOutput, options: &AnalyzeOptions) -> String {
        if options.quiet {
            return String::new();
        }
        if options.json {
            return to_json(output);
        }

        let a = &output.analysis;
        let mut lines = vec![
            "Cache Analysis".to_string(),
            "==============".to_string(),
            format!("Entries:        {}", a.total_entries),
            format!("Unique CIs:     {}", a.unique_cis),
            format!("Total accesses: {}", a.total_accesses),
            format!("Hit rate:       {:.1}%", a.stats.hit_rate() * 100.0),
            format!("Evictions:      {}", a.stats.evictions),
            format!("Size:           {} bytes", a.stats.total_size_bytes),
        ];

        if !a.type_distribution.is_empty() {
            lines.push(String::new());
            lines.push("By type:".to_string());
            for (content_type, count) in &a.type_distribution {
                lines.push(format!("  {:<16} {}", content_type, count));
            }
        }

        if !a.hot_entries.is_empty() {
            lines.push(String::new());
            lines.push("Hot entries:".to_string());
            for hot in &a.hot_entries {
                lines.push(format!(
                    "  {} {:<12} {} accesses ({:.1}/h)",
                    hot.key, hot.content_type, hot.accesses, hot.velocity
                ));
            }
        }

        lines.push(String::new());
        lines.push(format!(
            "Promotions: {} fired, {} pending",
            a.stats.promotions, a.promotion_pending
        ));
        for key in &output.promotion_candidates {
            lines.push(format!("  {}", key));
        }

        if let Some(stats) = &output.statistics {
            lines.push(String::new());
            lines.push(format!(
                "Engine: {} stores, {} retrievals ({} cache hits, {} backend hits, {} misses)",
                stats.engine.stores,
                stats.engine.retrievals,
                stats.engine.cache_hits,
                stats.engine.backend_hits,
                stats.engine.misses
            ));
            for (name, backend) in &stats.encoder.backends {
                lines.push(format!(
                    "  {}: {} stores, {} recalls, {:.0}% success",
                    name,
                    backend.stores,
                    backend.recalls,
                    backend.success_rate() * 100.0
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
    async fn test_analyze_reports_types_and_candidates() {
        let engine = engine();
        let key = engine.store(json!("a"), "fact", Metadata::new(), "apollo");
        engine.store(json!("b"), "thought", Metadata::new(), "athena");
        engine.retrieve(&key, "apollo");
        engine.retrieve(&key, "apollo");
        engine.flush_promotions().await;

        let cmd = AnalyzeCommand::new(engine);
        let options = AnalyzeOptions::default();
        let output = cmd.run(&options);

        assert_eq!(output.analysis.total_entries, 2);
        assert_eq!(output.analysis.unique_cis, 2);
        assert_eq!(output.promotion_candidates, vec![key.clone()]);
        assert!(output.statistics.is_none());

        let text = cmd.format_output(&output, &options);
        assert!(text.contains("Entries:        2"));
        assert!(text.contains("Promotions: 1 fired, 1 pending"));
    }

    #[test]
    fn test_detailed_includes_statistics() {
        let cmd = AnalyzeCommand::new(engine());
        let options = AnalyzeOptions {
            detailed: true,
            ..AnalyzeOptions::default()
        };
        let output = cmd.run(&options);

        let stats = output.statistics.as_ref().unwrap();
        assert!(stats.encoder.backends.contains_key("memory"));
        assert!(cmd.format_output(&output, &options).contains("Engine: 0 stores"));
    }
}
