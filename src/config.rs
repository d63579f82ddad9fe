//! Configuration loading for Engram.
//!
//! Configuration follows a precedence chain:
//! 1. Environment variables (highest priority)
//! 2. Project config (`.engram/config.toml`)
//! 3. User config (`~/.engram/config.toml`)
//! 4. Defaults (lowest priority)
//!
//! Configuration is read once when the engine is constructed. Nothing here is
//! mutable at runtime.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EngramError, Result};

/// Main configuration struct for Engram.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Cache tier configuration.
    pub cache: CacheConfig,
    /// Universal encoder configuration.
    pub encoder: EncoderConfig,
    /// Promotion wiring configuration.
    pub promotion: PromotionConfig,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count ceiling.
    pub max_size: usize,
    /// Retrieves required before an entry is promoted.
    pub promotion_threshold: u64,
    /// Mirror cache entries to a local snapshot file (best effort).
    pub persist_cache: bool,
    /// Snapshot location. Defaults to `<engram_home>/cache.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<PathBuf>,
    /// Also promote once two or more distinct CIs have touched an entry.
    pub multi_ci_promotion: bool,
}

/// Minimum valid max_size (a cache must hold the entry just stored).
pub const MIN_MAX_SIZE: usize = 1;

/// Minimum valid promotion_threshold.
pub const MIN_PROMOTION_THRESHOLD: u64 = 1;

impl CacheConfig {
    /// Check if max_size is valid (must be >= 1).
    pub fn is_valid_max_size(value: usize) -> bool {
        value >= MIN_MAX_SIZE
    }

    /// Check if promotion_threshold is valid (must be >= 1).
    ///
    /// A threshold of 0 could never be reached by a retrieve-only counter
    /// before the first access, which makes the setting meaningless.
    pub fn is_valid_promotion_threshold(value: u64) -> bool {
        value >= MIN_PROMOTION_THRESHOLD
    }

    /// Resolve the snapshot path.
    pub fn cache_file_path(&self) -> Option<PathBuf> {
        self.cache_file
            .clone()
            .or_else(|| engram_home().map(|h| h.join("cache.json")))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100_000,
            promotion_threshold: 2,
            persist_cache: false,
            cache_file: None,
            multi_ci_promotion: false,
        }
    }
}

/// Kinds of built-in backends that can be constructed from configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process map.
    Memory,
    /// One JSON document per key in a directory.
    File,
}

impl BackendKind {
    /// Get the kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::File => "file",
        }
    }
}

/// One entry of the ordered backend list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSpec {
    /// Backend implementation.
    pub kind: BackendKind,
    /// Registry name. Defaults to the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Storage directory for file backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl BackendSpec {
    /// Create a spec with no name or path.
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            name: None,
            path: None,
        }
    }

    /// The name this backend registers under.
    pub fn registry_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }
}

/// Universal encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Per-backend bound on each store/retrieve call.
    pub backend_timeout_ms: u64,
    /// Ordered backend list. Order is the synthesis tie-break priority.
    pub backends: Vec<BackendSpec>,
}

/// Minimum valid backend timeout.
pub const MIN_BACKEND_TIMEOUT_MS: u64 = 1;

impl EncoderConfig {
    /// Check if a backend timeout is valid (must be >= 1ms).
    pub fn is_valid_timeout_ms(value: u64) -> bool {
        value >= MIN_BACKEND_TIMEOUT_MS
    }

    /// The per-backend timeout as a `Duration`.
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend_timeout_ms: 3000,
            backends: vec![BackendSpec::new(BackendKind::Memory)],
        }
    }
}

/// Promotion wiring configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromotionConfig {
    /// Forward promoted entries to every backend via the encoder.
    pub forward_to_backends: bool,
    /// Capacity of channel subscriptions created by the engine.
    pub queue_capacity: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            forward_to_backends: true,
            queue_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration with full precedence chain.
    pub fn load() -> Self {
        match env::current_dir() {
            Ok(cwd) => Self::load_from_cwd(&cwd),
            Err(_) => {
                let mut config = Config::default();
                if let Some(user_config) = Self::load_user_config() {
                    config = config.merge(user_config);
                }
                config.apply_env_overrides();
                config
            }
        }
    }

    /// Load configuration with a specific working directory.
    pub fn load_from_cwd(cwd: &Path) -> Self {
        let mut config = Config::default();

        if let Some(user_config) = Self::load_user_config() {
            config = config.merge(user_config);
        }

        if let Some(project_config) = Self::load_project_config(cwd) {
            config = config.merge(project_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Load user config from `~/.engram/config.toml`.
    fn load_user_config() -> Option<Config> {
        let home = engram_home()?;
        Self::load_from_file(&home.join("config.toml")).ok()
    }

    /// Load project config from `.engram/config.toml` in the given directory.
    fn load_project_config(cwd: &Path) -> Option<Config> {
        let config_path = cwd.join(".engram").join("config.toml");
        if !config_path.exists() {
            return None;
        }
        match Self::load_from_file(&config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %config_path.display(), error = %e, "ignoring project config");
                None
            }
        }
    }

    /// Load config from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path).map_err(|e| EngramError::storage(path, e))?;
        toml::from_str(&content).map_err(|e| EngramError::config(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        // ENGRAM_CACHE_MAX_SIZE
        if let Ok(val) = env::var("ENGRAM_CACHE_MAX_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if CacheConfig::is_valid_max_size(n) => self.cache.max_size = n,
                _ => tracing::warn!(
                    "Invalid ENGRAM_CACHE_MAX_SIZE value '{}'. Must be >= {}. Using '{}'.",
                    val,
                    MIN_MAX_SIZE,
                    self.cache.max_size
                ),
            }
        }

        // ENGRAM_PROMOTION_THRESHOLD
        if let Ok(val) = env::var("ENGRAM_PROMOTION_THRESHOLD") {
            match val.parse::<u64>() {
                Ok(n) if CacheConfig::is_valid_promotion_threshold(n) => {
                    self.cache.promotion_threshold = n
                }
                _ => tracing::warn!(
                    "Invalid ENGRAM_PROMOTION_THRESHOLD value '{}'. Must be >= {}. Using '{}'.",
                    val,
                    MIN_PROMOTION_THRESHOLD,
                    self.cache.promotion_threshold
                ),
            }
        }

        // ENGRAM_PERSIST_CACHE
        if let Ok(val) = env::var("ENGRAM_PERSIST_CACHE") {
            self.cache.persist_cache = val == "true" || val == "1";
        }

        // ENGRAM_BACKEND_TIMEOUT_MS
        if let Ok(val) = env::var("ENGRAM_BACKEND_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(n) if EncoderConfig::is_valid_timeout_ms(n) => {
                    self.encoder.backend_timeout_ms = n
                }
                _ => tracing::warn!(
                    "Invalid ENGRAM_BACKEND_TIMEOUT_MS value '{}'. Must be >= {}. Using '{}'.",
                    val,
                    MIN_BACKEND_TIMEOUT_MS,
                    self.encoder.backend_timeout_ms
                ),
            }
        }
    }

    /// Merge another config into this one, field by field.
    ///
    /// A field is taken from `other` when it differs from the default, so each
    /// layer only needs to spell out its customizations. A higher layer cannot
    /// reset a lower layer's value back to the default.
    fn merge(mut self, other: Config) -> Self {
        let default_cache = CacheConfig::default();
        if other.cache.max_size != default_cache.max_size {
            self.cache.max_size = other.cache.max_size;
        }
        if other.cache.promotion_threshold != default_cache.promotion_threshold {
            self.cache.promotion_threshold = other.cache.promotion_threshold;
        }
        if other.cache.persist_cache != default_cache.persist_cache {
            self.cache.persist_cache = other.cache.persist_cache;
        }
        if other.cache.cache_file.is_some() {
            self.cache.cache_file = other.cache.cache_file;
        }
        if other.cache.multi_ci_promotion != default_cache.multi_ci_promotion {
            self.cache.multi_ci_promotion = other.cache.multi_ci_promotion;
        }

        let default_encoder = EncoderConfig::default();
        if other.encoder.backend_timeout_ms != default_encoder.backend_timeout_ms {
            self.encoder.backend_timeout_ms = other.encoder.backend_timeout_ms;
        }
        if other.encoder.backends != default_encoder.backends {
            self.encoder.backends = other.encoder.backends;
        }

        let default_promotion = PromotionConfig::default();
        if other.promotion.forward_to_backends != default_promotion.forward_to_backends {
            self.promotion.forward_to_backends = other.promotion.forward_to_backends;
        }
        if other.promotion.queue_capacity != default_promotion.queue_capacity {
            self.promotion.queue_capacity = other.promotion.queue_capacity;
        }

        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !CacheConfig::is_valid_max_size(self.cache.max_size) {
            return Err(EngramError::config(format!(
                "cache.max_size must be >= {}",
                MIN_MAX_SIZE
            )));
        }
        if !CacheConfig::is_valid_promotion_threshold(self.cache.promotion_threshold) {
            return Err(EngramError::config(format!(
                "cache.promotion_threshold must be >= {}",
                MIN_PROMOTION_THRESHOLD
            )));
        }
        if !EncoderConfig::is_valid_timeout_ms(self.encoder.backend_timeout_ms) {
            return Err(EngramError::config(format!(
                "encoder.backend_timeout_ms must be >= {}",
                MIN_BACKEND_TIMEOUT_MS
            )));
        }
        if self.promotion.queue_capacity == 0 {
            return Err(EngramError::config("promotion.queue_capacity must be >= 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.encoder.backends {
            let name = spec.registry_name();
            if !seen.insert(name.clone()) {
                return Err(EngramError::config(format!(
                    "duplicate backend name '{}'",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Save configuration to the project config file.
    ///
    /// Writes to `.engram/config.toml` in the given directory using a temp
    /// file + rename.
    pub fn save_project(&self, cwd: &Path) -> Result<()> {
        let engram_dir = cwd.join(".engram");

        if !engram_dir.exists() {
            fs::create_dir_all(&engram_dir).map_err(|e| EngramError::storage(&engram_dir, e))?;
        }

        let config_path = engram_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| EngramError::config(e.to_string()))?;

        let temp_path = engram_dir.join(".config.toml.tmp");
        fs::write(&temp_path, &content).map_err(|e| EngramError::storage(&temp_path, e))?;
        fs::rename(&temp_path, &config_path).map_err(|e| EngramError::storage(&config_path, e))?;

        Ok(())
    }
}

/// Get the Engram home directory.
///
/// Checks `ENGRAM_HOME` first, then falls back to `~/.engram`.
/// An empty `ENGRAM_HOME` is ignored.
pub fn engram_home() -> Option<PathBuf> {
    if let Ok(home) = env::var("ENGRAM_HOME") {
        if home.is_empty() {
            tracing::warn!("ENGRAM_HOME is empty, using default");
        } else {
            let path = PathBuf::from(&home);
            if path.is_absolute() {
                return Some(path);
            }
            if let Ok(canonical) = path.canonicalize() {
                return Some(canonical);
            }
            tracing::warn!("ENGRAM_HOME is relative and doesn't exist, using as-is");
            return Some(path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        return Some(home.join(".engram"));
    }

    // Containerized/minimal environments without HOME
    let fallback_path = fallback_engram_home();
    tracing::warn!(
        "HOME not set, using fallback location: {}",
        fallback_path.display()
    );
    Some(fallback_path)
}

#[cfg(unix)]
fn fallback_engram_home() -> PathBuf {
    use std::os::unix::fs::MetadataExt;
    let uid = std::fs::metadata("/").map(|m| m.uid()).unwrap_or(0);
    PathBuf::from(format!("/tmp/engram-{}", uid))
}

#[cfg(not(unix))]
fn fallback_engram_home() -> PathBuf {
    std::env::temp_dir().join("engram")
}

/// Default directory for a file backend with no explicit path.
///
/// Returns `<engram_home>/backends/<name>/`.
pub fn default_backend_dir(name: &str) -> Option<PathBuf> {
    engram_home().map(|h| h.join("backends").join(name))
}
