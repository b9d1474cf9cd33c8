//! Metrics-Instrumented Store
//!
//! Decorator counting reads, hits, writes and deletes of the wrapped store.
//! Results and errors pass through untouched; sink failures are logged and
//! dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use super::key::{normalize, normalize_all, Key};
use super::{KvStore, Settings, SharedStore, SizedStore, ValueMap};
use crate::error::Result;
use crate::metrics::{Datum, MetricsSink, StoreMetric};

/// Period of the size sampler
pub const SIZE_SAMPLE_PERIOD: Duration = Duration::from_secs(60);

/// Store decorator recording per-operation metrics
pub struct MetricStore<T> {
    inner: SharedStore<T>,
    sink: Arc<dyn MetricsSink>,
    model: String,
    store: String,
}

/// Decorate `store` with metrics if `settings.metrics_enabled` is set.
///
/// When the store can estimate its size, a detached task samples it every
/// [`SIZE_SAMPLE_PERIOD`] for the rest of the process. Decorating the same
/// store twice starts two samplers.
pub fn with_metrics<T>(
    store: SharedStore<T>,
    settings: &Settings,
    sink: Arc<dyn MetricsSink>,
) -> SharedStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    if !settings.metrics_enabled {
        return store;
    }

    let decorated = MetricStore::new(store, settings.model_id.to_string(), sink);
    decorated.spawn_size_sampler();

    Arc::new(decorated)
}

impl<T> MetricStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap `inner`, registering zero-valued counters for it
    pub fn new(inner: SharedStore<T>, model: impl Into<String>, sink: Arc<dyn MetricsSink>) -> Self {
        let model = model.into();
        let store = inner.name().to_string();

        if let Err(e) = sink.init(&model, &store) {
            debug!(model = %model, store = %store, error = %e, "can not initialize store metrics");
        }

        Self {
            inner,
            sink,
            model,
            store,
        }
    }

    /// Wrapped store
    pub fn inner(&self) -> &SharedStore<T> {
        &self.inner
    }

    fn spawn_size_sampler(&self) {
        if self.inner.sized().is_none() {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    model = %self.model,
                    store = %self.store,
                    "no tokio runtime, not sampling store size"
                );
                return;
            }
        };

        let inner = self.inner.clone();
        let sink = self.sink.clone();
        let model = self.model.clone();
        let store = self.store.clone();

        handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + SIZE_SAMPLE_PERIOD, SIZE_SAMPLE_PERIOD);

            loop {
                ticker.tick().await;

                let size = inner.sized().and_then(|sized| sized.estimate_size());
                if let Some(size) = size {
                    record(sink.as_ref(), StoreMetric::Size, &model, &store, size as i64);
                }
            }
        });
    }

    fn record(&self, metric: StoreMetric, value: usize) {
        record(self.sink.as_ref(), metric, &self.model, &self.store, value as i64);
    }
}

/// Number of distinct keys touched by a batch
fn distinct_keys<'a>(keys: impl IntoIterator<Item = &'a Key>) -> usize {
    keys.into_iter()
        .map(|key| normalize(key).unwrap_or_else(|_| key.to_string()))
        .collect::<HashSet<_>>()
        .len()
}

fn record(sink: &dyn MetricsSink, metric: StoreMetric, model: &str, store: &str, value: i64) {
    let datum = Datum {
        metric,
        model,
        store,
        value,
    };

    if let Err(e) = sink.record(&datum) {
        debug!(metric = %metric, model, store, error = %e, "can not record store metric");
    }
}

#[async_trait]
impl<T> KvStore<T> for MetricStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn contains(&self, key: &Key) -> Result<bool> {
        self.record(StoreMetric::Read, 1);

        let found = self.inner.contains(key).await?;
        if found {
            self.record(StoreMetric::Hit, 1);
        }

        Ok(found)
    }

    async fn get(&self, key: &Key) -> Result<Option<T>> {
        self.record(StoreMetric::Read, 1);

        let value = self.inner.get(key).await?;
        if value.is_some() {
            self.record(StoreMetric::Hit, 1);
        }

        Ok(value)
    }

    async fn get_batch(&self, keys: &[Key], dest: &mut ValueMap<T>) -> Result<Vec<Key>> {
        let requested = normalize_all(keys)?
            .into_iter()
            .collect::<HashSet<_>>()
            .len();
        self.record(StoreMetric::Read, requested);

        let missing = self.inner.get_batch(keys, dest).await?;
        self.record(StoreMetric::Hit, requested.saturating_sub(missing.len()));

        Ok(missing)
    }

    async fn put(&self, key: &Key, value: &T) -> Result<()> {
        self.inner.put(key, value).await?;
        self.record(StoreMetric::Write, 1);
        Ok(())
    }

    async fn put_batch(&self, values: &[(Key, T)]) -> Result<()> {
        self.inner.put_batch(values).await?;
        self.record(StoreMetric::Write, distinct_keys(values.iter().map(|(key, _)| key)));
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.inner.delete(key).await?;
        self.record(StoreMetric::Delete, 1);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[Key]) -> Result<()> {
        self.inner.delete_batch(keys).await?;
        self.record(StoreMetric::Delete, distinct_keys(keys));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.store
    }

    fn sized(&self) -> Option<&dyn SizedStore> {
        self.inner.sized()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kvstore::in_memory::InMemoryStore;
    use crate::metrics::{NoopSink, PrometheusSink};
    use assert_matches::assert_matches;

    const MODEL: &str = "shop.prod.catalog.api.items";

    fn settings(metrics_enabled: bool) -> Settings {
        let mut settings = Settings::named("items");
        settings.model_id.project = "shop".into();
        settings.model_id.environment = "prod".into();
        settings.model_id.family = "catalog".into();
        settings.model_id.application = "api".into();
        settings.metrics_enabled = metrics_enabled;
        settings
    }

    fn decorated(sink: Arc<PrometheusSink>) -> (SharedStore<i32>, Arc<PrometheusSink>) {
        let settings = settings(true);
        let inner: SharedStore<i32> = Arc::new(InMemoryStore::new(&settings));
        (with_metrics(inner, &settings, sink.clone()), sink)
    }

    fn value(sink: &PrometheusSink, metric: StoreMetric) -> i64 {
        sink.value(metric, MODEL, "InMemoryStore").unwrap()
    }

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn init(&self, _model: &str, _store: &str) -> Result<()> {
            Err(Error::Backend("sink down".into()))
        }

        fn record(&self, _datum: &Datum<'_>) -> Result<()> {
            Err(Error::Backend("sink down".into()))
        }
    }

    #[tokio::test]
    async fn test_disabled_returns_store_unchanged() {
        let settings = settings(false);
        let inner: SharedStore<i32> = Arc::new(InMemoryStore::new(&settings));
        let store = with_metrics(inner.clone(), &settings, Arc::new(NoopSink));

        assert!(Arc::ptr_eq(&inner, &store));
    }

    #[tokio::test]
    async fn test_reads_and_hits() {
        let (store, sink) = decorated(Arc::new(PrometheusSink::new().unwrap()));
        store.put(&Key::from("a"), &1).await.unwrap();

        store.get(&Key::from("a")).await.unwrap();
        store.get(&Key::from("b")).await.unwrap();
        store.contains(&Key::from("a")).await.unwrap();

        assert_eq!(value(&sink, StoreMetric::Read), 3);
        assert_eq!(value(&sink, StoreMetric::Hit), 2);
        assert_eq!(value(&sink, StoreMetric::Write), 1);
    }

    #[tokio::test]
    async fn test_batch_counts() {
        let (store, sink) = decorated(Arc::new(PrometheusSink::new().unwrap()));
        store
            .put_batch(&[(Key::from("a"), 1), (Key::from("b"), 2)])
            .await
            .unwrap();

        let mut dest = ValueMap::new();
        let missing = store
            .get_batch(&[Key::from("a"), Key::from("b"), Key::from("c")], &mut dest)
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);

        store.delete_batch(&[Key::from("a"), Key::from("b")]).await.unwrap();
        store.delete(&Key::from("c")).await.unwrap();

        assert_eq!(value(&sink, StoreMetric::Write), 2);
        assert_eq!(value(&sink, StoreMetric::Read), 3);
        assert_eq!(value(&sink, StoreMetric::Hit), 2);
        assert_eq!(value(&sink, StoreMetric::Delete), 3);
    }

    #[tokio::test]
    async fn test_duplicate_keys_count_once() {
        let (store, sink) = decorated(Arc::new(PrometheusSink::new().unwrap()));
        store
            .put_batch(&[(Key::from("a"), 1), (Key::from("a"), 2), (Key::from("b"), 3)])
            .await
            .unwrap();

        let mut dest = ValueMap::new();
        store
            .get_batch(&[Key::from("a"), Key::from("a"), Key::from("c")], &mut dest)
            .await
            .unwrap();

        store
            .delete_batch(&[Key::from("b"), Key::from("b")])
            .await
            .unwrap();

        assert_eq!(value(&sink, StoreMetric::Write), 2);
        assert_eq!(value(&sink, StoreMetric::Read), 2);
        assert_eq!(value(&sink, StoreMetric::Hit), 1);
        assert_eq!(value(&sink, StoreMetric::Delete), 1);
    }

    #[tokio::test]
    async fn test_errors_pass_through_without_counting() {
        let (store, sink) = decorated(Arc::new(PrometheusSink::new().unwrap()));

        assert_matches!(
            store.put(&Key::from(1.5f64), &1).await,
            Err(Error::UnsupportedKeyType { .. })
        );
        assert_matches!(
            store.get_batch(&[Key::Nil], &mut ValueMap::new()).await,
            Err(Error::InvalidKey { .. })
        );

        assert_eq!(value(&sink, StoreMetric::Write), 0);
        assert_eq!(value(&sink, StoreMetric::Read), 0);
    }

    #[tokio::test]
    async fn test_sink_failures_are_swallowed() {
        let settings = settings(true);
        let inner: SharedStore<i32> = Arc::new(InMemoryStore::new(&settings));
        let store = with_metrics(inner, &settings, Arc::new(FailingSink));

        store.put(&Key::from("a"), &7).await.unwrap();
        assert_eq!(store.get(&Key::from("a")).await.unwrap(), Some(7));
        store.delete(&Key::from("a")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_is_sampled_every_minute() {
        let (store, sink) = decorated(Arc::new(PrometheusSink::new().unwrap()));
        store.put(&Key::from("a"), &1).await.unwrap();
        store.put(&Key::from("b"), &2).await.unwrap();

        assert!(!sink.render().unwrap().contains("kvstore_size{"));

        tokio::time::sleep(SIZE_SAMPLE_PERIOD + Duration::from_secs(1)).await;

        assert_eq!(value(&sink, StoreMetric::Size), 2);
    }

    #[test]
    fn test_no_runtime_skips_sampler() {
        let settings = settings(true);
        let inner: SharedStore<i32> = Arc::new(InMemoryStore::new(&settings));
        let store = with_metrics(inner, &settings, Arc::new(NoopSink));

        assert_eq!(store.name(), "InMemoryStore");
    }
}
