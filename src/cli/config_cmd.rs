//! Config command for Engram.
//!
//! Prints the effective configuration and the files it was layered from.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::to_json;
use crate::config::{engram_home, Config};

/// Options for the config command.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Output as JSON.
    pub json: bool,
    /// Suppress output.
    pub quiet: bool,
    /// Write the effective configuration to `.engram/config.toml`.
    pub save: bool,
}

/// A config file in the precedence chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    /// "user" or "project".
    pub layer: String,
    pub path: PathBuf,
    pub exists: bool,
}

/// Output format for the config command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOutput {
    /// Effective configuration after env overrides.
    pub config: Config,
    /// Files consulted, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Whether the effective configuration passes validation.
    pub valid: bool,
    /// Where the configuration was saved, with `--save`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The config command implementation.
pub struct ConfigCommand {
    cwd: PathBuf,
    config: Config,
}

impl ConfigCommand {
    /// Create a new config command.
    pub fn new(cwd: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            cwd: cwd.into(),
            config,
        }
    }

    fn source(layer: &str, path: &Path) -> ConfigSource {
        ConfigSource {
            layer: layer.to_string(),
            path: path.to_path_buf(),
            exists: path.is_file(),
        }
    }

    /// Run the config command.
    pub fn run(&self, options: &ConfigOptions) -> ConfigOutput {
        let mut sources = Vec::new();
        if let Some(home) = engram_home() {
            sources.push(Self::source("user", &home.join("config.toml")));
        }
        sources.push(Self::source(
            "project",
            &self.cwd.join(".engram").join("config.toml"),
        ));

        let validation = self.config.validate();
        let mut output = ConfigOutput {
            config: self.config.clone(),
            sources,
            valid: validation.is_ok(),
            saved_to: None,
            error: validation.err().map(|e| e.to_string()),
        };

        if options.save && output.valid {
            match self.config.save_project(&self.cwd) {
                Ok(()) => output.saved_to = Some(self.cwd.join(".engram").join("config.toml")),
                Err(e) => {
                    output.valid = false;
                    output.error = Some(e.to_string());
                }
            }
        }
        output
    }

    /// Format output based on options.
    pub fn format_output(&self, output: &ConfigOutput, options: &ConfigOptions) -> String {
        if options.quiet {
            return String::new();
        }
        if options.json {
            return to_json(output);
        }

        let mut lines = Vec::new();
        for source in &output.sources {
            let mark = if source.exists { "+" } else { "-" };
            lines.push(format!(
                "# [{}] {}: {}",
                mark,
                source.layer,
                source.path.display()
            ));
        }
        if let Some(error) = &output.error {
            lines.push(format!("# invalid: {}", error));
        }
        if let Some(path) = &output.saved_to {
            lines.push(format!("# saved to {}", path.display()));
        }
        lines.push(String::new());

        let body = toml::to_string_pretty(&output.config)
            .unwrap_or_else(|e| format!("# failed to render config: {}\n", e));
        lines.join("\n") + "\n" + &body
    }
}
