//! Factory dispatcher (§4.6): selects a `DataStore`/`DocumentStore` pair by
//! a stream-type string against a registered map of named backends, with a
//! configured fallback. This is the seam a concrete backend crate (a
//! provider-specific SDK wrapper, out of scope per §1 Non-goals) plugs into.

use std::collections::HashMap;
use std::sync::Arc;

use crate::data_store::DataStore;
use crate::document_store::DocumentStore;
use crate::error::ConfigError;

/// The capability pair a backend registers under a stream-type key (§4.6).
pub struct Backend<D, S> {
    pub documents: Arc<D>,
    pub data: Arc<S>,
}

impl<D, S> Clone for Backend<D, S> {
    fn clone(&self) -> Self {
        Self {
            documents: Arc::clone(&self.documents),
            data: Arc::clone(&self.data),
        }
    }
}

impl<D, S> Backend<D, S> {
    #[must_use]
    pub fn new(documents: D, data: S) -> Self {
        Self {
            documents: Arc::new(documents),
            data: Arc::new(data),
        }
    }
}

/// Resolves a [`Backend`] by stream-type string, falling back to a
/// configured default name when the requested type has no registration
/// (§4.6, §9 Polymorphism over backends).
pub struct BackendFactory<D, S> {
    backends: HashMap<String, Backend<D, S>>,
    default_stream_type: Option<String>,
}

impl<D, S> BackendFactory<D, S>
where
    D: DocumentStore,
    S: DataStore,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_stream_type: None,
        }
    }

    /// Registers `backend` under `stream_type`. A later registration for the
    /// same key replaces the earlier one.
    pub fn register(&mut self, stream_type: impl Into<String>, backend: Backend<D, S>) {
        self.backends.insert(stream_type.into(), backend);
    }

    /// Sets the stream type used when [`BackendFactory::resolve`] is asked
    /// for a type with no direct registration.
    pub fn set_default(&mut self, stream_type: impl Into<String>) {
        self.default_stream_type = Some(stream_type.into());
    }

    /// Resolves the backend for `stream_type`, falling back to the
    /// configured default. Fails with
    /// [`ConfigError::UnableToCreateEventStreamForStreamType`] when neither
    /// the requested type nor the fallback has a registration.
    pub fn resolve(&self, stream_type: &str) -> Result<Backend<D, S>, ConfigError> {
        if let Some(backend) = self.backends.get(stream_type) {
            return Ok(backend.clone());
        }

        if let Some(default_type) = &self.default_stream_type {
            if let Some(backend) = self.backends.get(default_type) {
                return Ok(backend.clone());
            }
        }

        Err(ConfigError::UnableToCreateEventStreamForStreamType(
            stream_type.to_owned(),
        ))
    }
}

impl<D, S> Default for BackendFactory<D, S>
where
    D: DocumentStore,
    S: DataStore,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::{InMemoryBlobPrimitives, InMemoryDataStore, InMemoryDocumentStore};

    fn backend() -> Backend<InMemoryDocumentStore, InMemoryDataStore> {
        let data = InMemoryDataStore::new(InMemoryBlobPrimitives::new());
        Backend::new(InMemoryDocumentStore::new(), data)
    }

    #[test]
    fn resolves_a_directly_registered_stream_type() {
        let mut factory = BackendFactory::new();
        factory.register("orders", backend());

        assert!(factory.resolve("orders").is_ok());
    }

    #[test]
    fn falls_back_to_the_configured_default() {
        let mut factory = BackendFactory::new();
        factory.register("default", backend());
        factory.set_default("default");

        assert!(factory.resolve("unregistered-type").is_ok());
    }

    #[test]
    fn fails_when_neither_the_type_nor_the_fallback_is_registered() {
        let factory: BackendFactory<InMemoryDocumentStore, InMemoryDataStore> = BackendFactory::new();

        let err = factory.resolve("orders").unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnableToCreateEventStreamForStreamType("orders".to_owned())
        );
    }
}
