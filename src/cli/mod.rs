//! CLI commands for Engram.
//!
//! Every command follows the same shape: an `*Options` struct filled from
//! the command line, an `*Output` struct that serializes for `--json`, and a
//! command type whose `run` produces the output and whose `format_output`
//! renders it.
//!
//! - **Cache tier**: store, get, analyze
//! - **Both tiers**: search
//! - **Backend tier**: recall, backends
//! - **Utility**: config

pub mod analyze;
pub mod backends_cmd;
pub mod config_cmd;
pub mod get;
pub mod recall;
pub mod search;
pub mod store;

pub use analyze::AnalyzeCommand;
pub use backends_cmd::BackendsCommand;
pub use config_cmd::ConfigCommand;
pub use get::GetCommand;
pub use recall::RecallCommand;
pub use search::SearchCommand;
pub use store::StoreCommand;

use serde_json::Value;

use crate::backends::Metadata;
use crate::error::{EngramError, Result};

/// CI identifier used when the caller does not name one.
pub const DEFAULT_CI: &str = "cli";

/// Parse `key=value` pairs into metadata.
///
/// Values that parse as JSON keep their type (`n=3` stores a number);
/// anything else is stored as a string.
pub fn parse_metadata(pairs: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(EngramError::config(format!(
                "metadata '{}' is not in key=value form",
                pair
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(EngramError::config(format!(
                "metadata '{}' has an empty key",
                pair
            )));
        }
        let value =
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// Render any output as pretty JSON, falling back to an empty object.
pub(crate) fn to_json<T: serde::Serialize>(output: &T) -> String {
    serde_json::to_string_pretty(output).unwrap_or_else(|_| "{}".to_string())
}

/// Shorten content for one-line display.
pub(crate) fn preview(content: &Value, max_chars: usize) -> String {
    let text = crate::util::canonical_content(content);
    if text.chars().count() <= max_chars {
        return text;
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}
