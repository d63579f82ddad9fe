//! Unified error types for Engram with fail-open philosophy.
//!
//! Backend failures are first-class outcomes, not exceptions: a failing or
//! hung backend occupies one slot of a fan-out result and never aborts the
//! whole operation. Best-effort paths (cache mirroring, promotion handlers)
//! log and swallow their errors through [`FailOpen`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for Engram operations.
#[derive(Error, Debug)]
pub enum EngramError {
    /// I/O errors from snapshot or file backend operations.
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single backend's store or retrieve failed.
    #[error("backend '{backend}' unavailable: {message}")]
    Backend { backend: String, message: String },

    /// A single backend did not answer within the per-call bound.
    #[error("backend '{backend}' timed out after {timeout_ms}ms")]
    BackendTimeout { backend: String, timeout_ms: u64 },

    /// JSON or TOML serialization errors.
    #[error("serialization error: {message}")]
    Serde { message: String },

    /// Configuration loading or validation errors.
    #[error("config error: {message}")]
    Config { message: String },

    /// A promotion subscriber failed to handle a promoted entry.
    #[error("promotion notification failed: {message}")]
    Promotion { message: String },
}

/// A specialized Result type for Engram operations.
pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Create a storage error from an I/O error.
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Create a backend error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a backend timeout error.
    pub fn backend_timeout(backend: impl Into<String>, timeout_ms: u64) -> Self {
        Self::BackendTimeout {
            backend: backend.into(),
            timeout_ms,
        }
    }

    /// Create a serialization error.
    pub fn serde(message: impl Into<String>) -> Self {
        Self::Serde {
            message: message.into(),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a promotion notification error.
    pub fn promotion(message: impl Into<String>) -> Self {
        Self::Promotion {
            message: message.into(),
        }
    }

    /// Whether this error is confined to a single backend slot.
    ///
    /// Such errors are reported per backend and never fail a fan-out call.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::BackendTimeout { .. })
    }
}

impl From<io::Error> for EngramError {
    fn from(err: io::Error) -> Self {
        Self::Storage {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde {
            message: err.to_string(),
        }
    }
}

/// Trait for fail-open error handling.
///
/// Log the error and return a safe default instead of propagating.
pub trait FailOpen<T> {
    /// Handle an error by logging a warning and returning the default value.
    fn fail_open_default(self, context: &str) -> T
    where
        T: Default;

    /// Handle an error by logging a warning and returning the provided fallback.
    fn fail_open_with(self, context: &str, fallback: T) -> T;
}

impl<T> FailOpen<T> for Result<T> {
    fn fail_open_default(self, context: &str) -> T
    where
        T: Default,
    {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("{}: {} (fail-open: using default)", context, err);
                T::default()
            }
        }
    }

    fn fail_open_with(self, context: &str, fallback: T) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("{}: {} (fail-open: using fallback)", context, err);
                fallback
            }
        }
    }
}

/// Exit codes for the Engram CLI.
pub mod exit_codes {
    /// Command completed.
    pub const SUCCESS: i32 = 0;

    /// The requested key was not found anywhere.
    pub const NOT_FOUND: i32 = 1;

    /// The command failed before producing a result.
    pub const ERROR: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = EngramError::storage(
            "/tmp/cache.json",
            io::Error::new(io::ErrorKind::NotFound, "file not found"),
        );
        assert!(err.to_string().contains("storage error"));
        assert!(err.to_string().contains("/tmp/cache.json"));
    }

    #[test]
    fn test_backend_error_display() {
        let err = EngramError::backend("vector", "connection refused");
        assert_eq!(
            err.to_string(),
            "backend 'vector' unavailable: connection refused"
        );
    }

    #[test]
    fn test_backend_timeout_display() {
        let err = EngramError::backend_timeout("document", 3000);
        assert_eq!(err.to_string(), "backend 'document' timed out after 3000ms");
    }

    #[test]
    fn test_promotion_error_display() {
        let err = EngramError::promotion("subscriber dropped");
        assert_eq!(
            err.to_string(),
            "promotion notification failed: subscriber dropped"
        );
    }

    #[test]
    fn test_is_backend_unavailable() {
        assert!(EngramError::backend("a", "b").is_backend_unavailable());
        assert!(EngramError::backend_timeout("a", 1).is_backend_unavailable());
        assert!(!EngramError::config("bad").is_backend_unavailable());
        assert!(!EngramError::promotion("bad").is_backend_unavailable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: EngramError = io_err.into();
        assert!(matches!(err, EngramError::Storage { .. }));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: EngramError = json_err.into();
        assert!(matches!(err, EngramError::Serde { .. }));
    }

    #[test]
    fn test_fail_open_default() {
        let result: Result<Vec<String>> = Err(EngramError::backend("kv", "down"));
        assert!(result.fail_open_default("test context").is_empty());
    }

    #[test]
    fn test_fail_open_with() {
        let result: Result<i32> = Err(EngramError::promotion("test"));
        assert_eq!(result.fail_open_with("test context", 42), 42);
    }

    #[test]
    fn test_fail_open_success() {
        let result: Result<i32> = Ok(100);
        assert_eq!(result.fail_open_default("test context"), 100);
    }
}
