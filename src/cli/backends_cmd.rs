//! Backends command for Engram.
//!
//! Shows registered storage backends in priority order with their health.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cli::to_json;
use crate::config::{BackendSpec, Config};
use crate::engine::MemoryEngine;

/// Options for the backends command.
#[derive(Debug, Clone, Default)]
pub struct BackendsOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
}

/// Output format for the backends command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsOutput {
    /// Registered backends, highest priority first.
    pub backends: Vec<BackendDetail>,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
}

impl BackendsOutput {
    /// Number of backends that answered the health check.
    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.healthy).count()
    }
}

/// Detailed backend information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDetail {
    /// Registry name.
    pub name: String,
    /// Synthesis tie-break priority (0 is highest).
    pub priority: usize,
    /// Backend kind from configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Storage location for file backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Health check result.
    pub healthy: bool,
}

/// The backends command implementation.
pub struct BackendsCommand {
    engine: Arc<MemoryEngine>,
    config: Config,
}

impl BackendsCommand {
    /// Create a new backends command.
    pub fn new(engine: Arc<MemoryEngine>, config: Config) -> Self {
        Self { engine, config }
    }

    fn spec_for(&self, name: &str) -> Option<&BackendSpec> {
        self.config
            .encoder
            .backends
            .iter()
            .find(|spec| spec.registry_name() == name)
    }

    /// Run the backends command.
    pub async fn run(&self, _options: &BackendsOptions) -> BackendsOutput {
        let health = self.engine.encoder().ping_all().await;

        let backends = health
            .into_iter()
            .enumerate()
            .map(|(priority, (name, healthy))| {
                let spec = self.spec_for(&name);
                BackendDetail {
                    kind: spec.map(|s| s.kind.as_str().to_string()),
                    path: spec
                        .and_then(|s| s.path.as_ref())
                        .map(|p| p.display().to_string()),
                    name,
                    priority,
                    healthy,
                }
            })
            .collect();

        BackendsOutput {
            backends,
            timeout_ms: self.engine.encoder().timeout().as_millis() as u64,
        }
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &BackendsOutput, options: &BackendsOptions) -> String {
        if options.quiet {
            return String::new();
        }

        if options.json {
            to_json(output)
        } else {
            self.format_human_readable(output)
        }
    }

    /// Format output as human-readable text.
    fn format_human_readable(&self, output: &BackendsOutput) -> String {
        if output.backends.is_empty() {
            return "No backends registered.\n".to_string();
        }

        let mut lines = vec!["Registered backends (priority order):\n".to_string()];

        for backend in &output.backends {
            let status = if backend.healthy { "+" } else { "-" };
            let kind = backend.kind.as_deref().unwrap_or("custom");
            let path_info = backend
                .path
                .as_ref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default();

            lines.push(format!(
                "  [{}] {}. {}: {}{}",
                status,
                backend.priority + 1,
                backend.name,
                kind,
                path_info
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "{}/{} healthy, timeout {}ms per call",
            output.healthy_count(),
            output.backends.len(),
            output.timeout_ms
        ));

        lines.join("\n") + "\n"
    }
}
