//! Ordered backend registry.
//!
//! Maps backend names to handles in registration order. The order is fixed
//! once the encoder is built and doubles as the synthesis tie-break priority:
//! the first-registered backend wins ties.

use std::path::PathBuf;
use std::sync::Arc;

use crate::backends::file::FileBackend;
use crate::backends::memory::InMemoryBackend;
use crate::backends::traits::StorageBackend;
use crate::config::{default_backend_dir, BackendKind, BackendSpec, EncoderConfig};
use crate::error::{EngramError, Result};

/// A named backend handle.
#[derive(Clone)]
pub struct RegisteredBackend {
    /// Registry name (may differ from the backend's own `name()`).
    pub name: String,
    /// Shared backend handle.
    pub backend: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered, name-unique set of backends.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<RegisteredBackend>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own name.
    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) -> Result<()> {
        let name = backend.name().to_string();
        self.register_as(name, backend)
    }

    /// Register a backend under an explicit name.
    ///
    /// Returns a config error if the name is already taken.
    pub fn register_as(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(EngramError::config(format!(
                "backend '{}' is already registered",
                name
            )));
        }
        self.backends.push(RegisteredBackend { name, backend });
        Ok(())
    }

    /// Builder-style registration.
    pub fn with(mut self, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        self.register(backend)?;
        Ok(self)
    }

    /// Build the registry described by the encoder configuration.
    pub fn from_config(config: &EncoderConfig) -> Result<Self> {
        let mut registry = Self::new();
        for spec in &config.backends {
            let name = spec.registry_name();
            let backend = build_backend(spec, &name)?;
            registry.register_as(name, backend)?;
        }
        Ok(registry)
    }

    /// Check if a name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.backends.iter().any(|b| b.name == name)
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn StorageBackend>> {
        self.backends
            .iter()
            .find(|b| b.name == name)
            .map(|b| &b.backend)
    }

    /// Registration priority of a name (0 is highest).
    pub fn priority(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.name == name)
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name.clone()).collect()
    }

    /// Iterate in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredBackend> {
        self.backends.iter()
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

fn build_backend(spec: &BackendSpec, name: &str) -> Result<Arc<dyn StorageBackend>> {
    match spec.kind {
        BackendKind::Memory => Ok(Arc::new(InMemoryBackend::new(name))),
        BackendKind::File => {
            let dir: PathBuf = match &spec.path {
                Some(path) => path.clone(),
                None => default_backend_dir(name).ok_or_else(|| {
                    EngramError::config(format!(
                        "file backend '{}' has no path and no home directory is available",
                        name
                    ))
                })?,
            };
            Ok(Arc::new(FileBackend::new(name, dir)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::traits::tests::{AbsentBackend, FailingBackend};
    use tempfile::TempDir;

    #[test]
    fn test_registration_order_is_priority() {
        let registry = BackendRegistry::new()
            .with(Arc::new(AbsentBackend::new("sql")))
            .unwrap()
            .with(Arc::new(FailingBackend::new("vector")))
            .unwrap();

        assert_eq!(registry.names(), vec!["sql", "vector"]);
        assert_eq!(registry.priority("sql"), Some(0));
        assert_eq!(registry.priority("vector"), Some(1));
        assert_eq!(registry.priority("graph"), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(AbsentBackend::new("kv"))).unwrap();

        let err = registry
            .register(Arc::new(AbsentBackend::new("kv")))
            .unwrap_err();
        assert!(matches!(err, EngramError::Config { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_as_overrides_name() {
        let mut registry = BackendRegistry::new();
        registry
            .register_as("document", Arc::new(AbsentBackend::new("inner")))
            .unwrap();

        assert!(registry.contains("document"));
        assert!(!registry.contains("inner"));
        assert!(registry.get("document").is_some());
    }

    #[test]
    fn test_from_config() {
        let dir = TempDir::new().unwrap();
        let config = EncoderConfig {
            backend_timeout_ms: 100,
            backends: vec![
                BackendSpec::new(BackendKind::Memory),
                BackendSpec {
                    kind: BackendKind::File,
                    name: Some("docs".to_string()),
                    path: Some(dir.path().join("docs")),
                },
            ],
        };

        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["memory", "docs"]);
        assert!(dir.path().join("docs").is_dir());
    }

    #[test]
    fn test_from_config_duplicate_names() {
        let config = EncoderConfig {
            backend_timeout_ms: 100,
            backends: vec![
                BackendSpec::new(BackendKind::Memory),
                BackendSpec::new(BackendKind::Memory),
            ],
        };
        assert!(BackendRegistry::from_config(&config).is_err());
    }
}
