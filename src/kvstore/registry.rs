//! Element Registry
//!
//! Maps the element names used in a [`ChainConfig`] to tier factories.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::chain::ChainStore;
use super::config::ChainConfig;
use super::encoded::{ByteBackend, EncodedStore};
use super::in_memory::InMemoryStore;
use super::{Settings, SharedStore};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;

/// Element name of the built-in in-memory tier
pub const IN_MEMORY_ELEMENT: &str = "inMemory";

/// Builds one tier from the chain settings
pub type TierFactory<T> = Arc<dyn Fn(&Settings) -> Result<SharedStore<T>> + Send + Sync>;

/// Named tier factories
pub struct StoreRegistry<T> {
    factories: HashMap<String, TierFactory<T>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl<T> StoreRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Registry knowing the `inMemory` element
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            sink: None,
        };
        registry.register(IN_MEMORY_ELEMENT, |settings| {
            Ok(Arc::new(InMemoryStore::<T>::new(settings)) as SharedStore<T>)
        });
        registry
    }

    /// Register or replace the factory for `name`
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Settings) -> Result<SharedStore<T>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Send metrics of built chains to `sink`
    pub fn set_metrics_sink(&mut self, sink: Arc<dyn MetricsSink>) -> &mut Self {
        self.sink = Some(sink);
        self
    }

    /// Check if an element name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Factory registered for `name`
    pub fn factory(&self, name: &str) -> Option<TierFactory<T>> {
        self.factories.get(name).cloned()
    }

    /// Assemble the chain described by `config`
    pub fn build(&self, config: &ChainConfig) -> Result<ChainStore<T>> {
        config.validate()?;
        let settings = config.settings()?;

        let mut builder = ChainStore::builder(settings);
        for element in &config.elements {
            let factory = self.factory(element).ok_or_else(|| Error::UnknownElement {
                name: config.model_id.name.clone(),
                element: element.clone(),
            })?;
            builder = builder.tier_factory(factory);
        }

        if let Some(sink) = &self.sink {
            builder = builder.metrics_sink(sink.clone());
        }

        info!(
            model = %config.model_id,
            elements = ?config.elements,
            "building kvstore chain from config"
        );

        builder.build()
    }
}

impl<T> StoreRegistry<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Register a byte backend as element `name`, storing JSON-encoded values
    pub fn register_backend<B>(&mut self, name: impl Into<String>, backend: Arc<B>) -> &mut Self
    where
        B: ByteBackend + ?Sized + 'static,
    {
        self.register(name, move |settings| {
            Ok(Arc::new(EncodedStore::<T, B>::new(backend.clone(), settings)) as SharedStore<T>)
        })
    }
}

impl<T> Default for StoreRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
