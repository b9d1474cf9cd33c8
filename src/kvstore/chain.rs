//! Chain Store
//!
//! Orders tiers from fastest to slowest and serves every operation across
//! them. Reads walk the tiers until a value is found and copy it into the
//! faster tiers in front of the hit. Writes and deletes go to every tier.
//!
//! # Failure Policy
//!
//! Only the last tier is authoritative. Its failures are returned as
//! [`Error::Tier`]; failures of every other tier are logged and count as a
//! miss (reads) or are skipped (writes and deletes).
//!
//! # Missing-Value Cache
//!
//! With `missing_cache_enabled`, a full miss leaves a negative marker in a
//! dedicated store and later reads of that key answer "not found" without
//! touching a tier until the marker expires. Writes never clear markers, so a
//! key written after a miss may read as missing for up to one TTL.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::batch::{get_batch, ChunkFetch};
use super::in_memory::InMemoryStore;
use super::key::{normalize, normalize_all, Key};
use super::metric::with_metrics;
use super::registry::TierFactory;
use super::{KvStore, Settings, SharedStore, ValueMap};
use crate::error::{Error, Result};
use crate::metrics::{global_sink, MetricsSink, NoopSink};

/// Store holding negative markers
pub type MissingCache = Arc<dyn KvStore<()>>;

/// Ordered chain of tiers with promotion and negative caching
pub struct ChainStore<T> {
    tiers: Vec<SharedStore<T>>,
    missing_cache: Option<MissingCache>,
    settings: Settings,
}

enum TierSource<T> {
    Factory(TierFactory<T>),
    Store(SharedStore<T>),
}

/// Assembles a [`ChainStore`], decorating tiers with metrics when enabled
pub struct ChainStoreBuilder<T> {
    settings: Settings,
    tiers: Vec<TierSource<T>>,
    missing_cache: Option<MissingCache>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl<T> ChainStoreBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            tiers: Vec::new(),
            missing_cache: None,
            sink: None,
        }
    }

    /// Append a tier built from the chain settings
    pub fn tier<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Settings) -> Result<SharedStore<T>> + Send + Sync + 'static,
    {
        self.tiers.push(TierSource::Factory(Arc::new(factory)));
        self
    }

    /// Append a tier built from a shared factory
    pub fn tier_factory(mut self, factory: TierFactory<T>) -> Self {
        self.tiers.push(TierSource::Factory(factory));
        self
    }

    /// Append an already constructed tier
    pub fn tier_store(mut self, store: SharedStore<T>) -> Self {
        self.tiers.push(TierSource::Store(store));
        self
    }

    /// Use `store` for negative markers instead of an in-memory store.
    /// Ignored unless `missing_cache_enabled` is set.
    pub fn missing_cache(mut self, store: MissingCache) -> Self {
        self.missing_cache = Some(store);
        self
    }

    /// Send metrics to `sink` instead of the process-wide Prometheus sink
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build every tier and the missing-value cache
    pub fn build(self) -> Result<ChainStore<T>> {
        let settings = self.settings;
        let sink: Arc<dyn MetricsSink> = match (settings.metrics_enabled, self.sink) {
            (_, Some(sink)) => sink,
            (true, None) => global_sink(),
            (false, None) => Arc::new(NoopSink),
        };

        let mut tiers = Vec::with_capacity(self.tiers.len());
        for source in self.tiers {
            let store = match source {
                TierSource::Factory(factory) => factory(&settings)?,
                TierSource::Store(store) => store,
            };
            tiers.push(with_metrics(store, &settings, sink.clone()));
        }

        let missing_cache = if settings.missing_cache_enabled {
            let mut cache_settings = settings.clone();
            cache_settings.model_id.name = format!("{}-missingCache", settings.model_id.name);

            let store = match self.missing_cache {
                Some(store) => store,
                None => Arc::new(InMemoryStore::<()>::new(&cache_settings)) as MissingCache,
            };
            Some(with_metrics(store, &cache_settings, sink))
        } else {
            None
        };

        info!(
            model = %settings.model_id,
            tiers = ?tiers.iter().map(|t| t.name()).collect::<Vec<_>>(),
            missing_cache = missing_cache.is_some(),
            "assembled kvstore chain"
        );

        Ok(ChainStore {
            tiers,
            missing_cache,
            settings,
        })
    }
}

impl<T> ChainStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start assembling a chain
    pub fn builder(settings: Settings) -> ChainStoreBuilder<T> {
        ChainStoreBuilder::new(settings)
    }

    /// Build a chain from ordered tier factories
    pub fn new(
        factories: Vec<TierFactory<T>>,
        missing_cache: Option<MissingCache>,
        settings: Settings,
    ) -> Result<Self> {
        let mut builder = Self::builder(settings);
        for factory in factories {
            builder = builder.tier_factory(factory);
        }
        if let Some(store) = missing_cache {
            builder = builder.missing_cache(store);
        }
        builder.build()
    }

    /// Tiers in query order
    pub fn tiers(&self) -> &[SharedStore<T>] {
        &self.tiers
    }

    /// Negative marker store, if enabled
    pub fn missing_cache(&self) -> Option<&MissingCache> {
        self.missing_cache.as_ref()
    }

    /// Settings the chain was built with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn is_last(&self, index: usize) -> bool {
        index + 1 == self.tiers.len()
    }

    /// Surface a failure of the last tier, log any other
    fn tier_failed(&self, op: &'static str, index: usize, key: &str, err: Error) -> Result<()> {
        let tier = self.tiers[index].name();
        if self.is_last(index) {
            return Err(Error::tier(op, key, tier, err));
        }

        warn!(tier, position = index, op, key, error = %err, "kvstore tier failed, skipping it");
        Ok(())
    }

    async fn is_marked_missing(&self, key: &Key, normalized: &str) -> bool {
        let Some(cache) = &self.missing_cache else {
            return false;
        };

        match cache.get(key).await {
            Ok(marker) => {
                if marker.is_some() {
                    debug!(key = normalized, "key is marked missing, skipping tiers");
                }
                marker.is_some()
            }
            Err(e) => {
                warn!(key = normalized, error = %e, "can not read missing cache");
                false
            }
        }
    }

    async fn mark_missing(&self, key: &Key, normalized: &str) {
        if let Some(cache) = &self.missing_cache {
            if let Err(e) = cache.put(key, &()).await {
                warn!(key = normalized, error = %e, "can not mark key as missing");
            }
        }
    }

    async fn mark_missing_batch(&self, keys: &[Key]) {
        if let Some(cache) = &self.missing_cache {
            let markers: Vec<(Key, ())> = keys.iter().map(|key| (key.clone(), ())).collect();
            if let Err(e) = cache.put_batch(&markers).await {
                warn!(keys = markers.len(), error = %e, "can not mark keys as missing");
            }
        }
    }

    /// Copy a value found at `found_at` into every faster tier
    async fn promote(&self, key: &Key, normalized: &str, value: &T, found_at: usize) {
        for index in (0..found_at).rev() {
            let tier = &self.tiers[index];
            match tier.put(key, value).await {
                Ok(()) => debug!(tier = tier.name(), position = index, key = normalized, "promoted value"),
                Err(e) => warn!(
                    tier = tier.name(),
                    position = index,
                    key = normalized,
                    error = %e,
                    "can not promote value"
                ),
            }
        }
    }

    async fn promote_batch(&self, found: &ValueMap<T>, found_at: usize) {
        if found_at == 0 || found.is_empty() {
            return;
        }

        let values: Vec<(Key, T)> = found
            .iter()
            .map(|(key, value)| (Key::Str(key.clone()), value.clone()))
            .collect();

        for index in (0..found_at).rev() {
            let tier = &self.tiers[index];
            if let Err(e) = tier.put_batch(&values).await {
                warn!(
                    tier = tier.name(),
                    position = index,
                    keys = values.len(),
                    error = %e,
                    "can not promote values"
                );
            }
        }
    }

    /// Walk one chunk of normalized keys through the missing cache and the tiers
    async fn get_chunk(&self, chunk: Vec<String>) -> Result<ChunkFetch<T>> {
        let mut fetched = ChunkFetch::default();
        let mut pending: Vec<Key> = chunk.into_iter().map(Key::Str).collect();

        if let Some(cache) = &self.missing_cache {
            let mut markers = ValueMap::new();
            match cache.get_batch(&pending, &mut markers).await {
                Ok(_) if !markers.is_empty() => {
                    let (marked, rest): (Vec<Key>, Vec<Key>) = pending
                        .into_iter()
                        .partition(|key| matches!(key, Key::Str(s) if markers.contains_key(s)));
                    debug!(keys = marked.len(), "keys are marked missing, skipping tiers");
                    fetched.missing.extend(marked.iter().map(Key::to_string));
                    pending = rest;
                }
                Ok(_) => {}
                Err(e) => warn!(keys = pending.len(), error = %e, "can not read missing cache"),
            }
        }

        for index in 0..self.tiers.len() {
            if pending.is_empty() {
                break;
            }

            let mut found = ValueMap::new();
            match self.tiers[index].get_batch(&pending, &mut found).await {
                Ok(missing) => {
                    self.promote_batch(&found, index).await;
                    fetched.found.extend(found);
                    pending = missing;
                }
                Err(e) => self.tier_failed("get_batch", index, &key_count(pending.len()), e)?,
            }
        }

        if !pending.is_empty() {
            self.mark_missing_batch(&pending).await;
            fetched.missing.extend(pending.iter().map(Key::to_string));
        }

        Ok(fetched)
    }
}

/// Error context for batch operations
fn key_count(count: usize) -> String {
    format!("{} keys", count)
}

impl<T> fmt::Debug for ChainStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers: Vec<&str> = self.tiers.iter().map(|tier| tier.name()).collect();
        f.debug_struct("ChainStore")
            .field("model", &self.settings.model_id.to_string())
            .field("tiers", &tiers)
            .field("missing_cache", &self.missing_cache.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<T> KvStore<T> for ChainStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn contains(&self, key: &Key) -> Result<bool> {
        let normalized = normalize(key)?;
        if self.is_marked_missing(key, &normalized).await {
            return Ok(false);
        }

        for index in 0..self.tiers.len() {
            match self.tiers[index].get(key).await {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {}
                Err(e) => self.tier_failed("contains", index, &normalized, e)?,
            }
        }

        self.mark_missing(key, &normalized).await;
        Ok(false)
    }

    async fn get(&self, key: &Key) -> Result<Option<T>> {
        let normalized = normalize(key)?;
        if self.is_marked_missing(key, &normalized).await {
            return Ok(None);
        }

        for index in 0..self.tiers.len() {
            match self.tiers[index].get(key).await {
                Ok(Some(value)) => {
                    self.promote(key, &normalized, &value, index).await;
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(e) => self.tier_failed("get", index, &normalized, e)?,
            }
        }

        self.mark_missing(key, &normalized).await;
        Ok(None)
    }

    async fn get_batch(&self, keys: &[Key], dest: &mut ValueMap<T>) -> Result<Vec<Key>> {
        let batch_size = self.settings.effective_batch_size();
        get_batch(keys, dest, batch_size, |chunk| self.get_chunk(chunk)).await
    }

    async fn put(&self, key: &Key, value: &T) -> Result<()> {
        let normalized = normalize(key)?;

        for index in 0..self.tiers.len() {
            if let Err(e) = self.tiers[index].put(key, value).await {
                self.tier_failed("put", index, &normalized, e)?;
            }
        }

        Ok(())
    }

    async fn put_batch(&self, values: &[(Key, T)]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }

        let keys: Vec<Key> = values.iter().map(|(key, _)| key.clone()).collect();
        normalize_all(&keys)?;

        for index in 0..self.tiers.len() {
            if let Err(e) = self.tiers[index].put_batch(values).await {
                self.tier_failed("put_batch", index, &key_count(values.len()), e)?;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let normalized = normalize(key)?;

        for index in 0..self.tiers.len() {
            if let Err(e) = self.tiers[index].delete(key).await {
                self.tier_failed("delete", index, &normalized, e)?;
            }
        }

        Ok(())
    }

    async fn delete_batch(&self, keys: &[Key]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        normalize_all(keys)?;

        for index in 0..self.tiers.len() {
            if let Err(e) = self.tiers[index].delete_batch(keys).await {
                self.tier_failed("delete_batch", index, &key_count(keys.len()), e)?;
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "ChainStore"
    }
}

// =============================================================================
// Tests
// =============================================================================
