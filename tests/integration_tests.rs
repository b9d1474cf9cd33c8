//! kvchain Integration Tests
//!
//! - Chain scenarios over in-memory tiers
//! - Failure handling with an unreliable backend
//! - Assembly from configuration
//! - Metrics of an assembled chain

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use kvchain::kvstore::{ByteBackend, InMemoryByteBackend};
use kvchain::{
    ChainStore, Error, InMemoryStore, Key, KvStore, Result, Settings, SharedStore, ValueMap,
};

fn memory<T: Clone + Send + Sync + 'static>() -> Arc<InMemoryStore<T>> {
    Arc::new(InMemoryStore::new(&Settings::named("tier")))
}

// =============================================================================
// Chain Scenarios
// =============================================================================

mod chain_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_reaches_every_tier() {
        let (a, b) = (memory::<i32>(), memory::<i32>());
        let chain = ChainStore::builder(Settings::named("scenario"))
            .tier_store(a.clone())
            .tier_store(b.clone())
            .build()
            .unwrap();

        chain.put(&Key::from("x"), &1).await.unwrap();

        assert_eq!(a.get(&Key::from("x")).await.unwrap(), Some(1));
        assert_eq!(b.get(&Key::from("x")).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_get_promotes_from_slower_tier() {
        let (a, b) = (memory::<i32>(), memory::<i32>());
        b.put(&Key::from("y"), &2).await.unwrap();

        let chain = ChainStore::builder(Settings::named("scenario"))
            .tier_store(a.clone())
            .tier_store(b.clone())
            .build()
            .unwrap();

        assert_eq!(chain.get(&Key::from("y")).await.unwrap(), Some(2));
        assert!(a.contains(&Key::from("y")).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_batch_with_duplicate_keys() {
        let (a, b) = (memory::<i32>(), memory::<i32>());
        b.put(&Key::from("a"), &1).await.unwrap();

        let chain = ChainStore::builder(Settings::named("scenario"))
            .tier_store(a.clone())
            .tier_store(b.clone())
            .build()
            .unwrap();

        let mut dest = ValueMap::new();
        let keys = [Key::from("a"), Key::from("a"), Key::from("b")];
        let missing = chain.get_batch(&keys, &mut dest).await.unwrap();

        assert_eq!(missing, vec![Key::from("b")]);
        assert_eq!(dest.len(), 1);
        assert_eq!(dest["a"], 1);
        assert_eq!(a.get(&Key::from("a")).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_delete_removes_from_every_tier() {
        let (a, b) = (memory::<String>(), memory::<String>());
        let chain = ChainStore::builder(Settings::named("scenario"))
            .tier_store(a.clone())
            .tier_store(b.clone())
            .build()
            .unwrap();

        chain
            .put_batch(&[
                (Key::from(1u64), "one".to_string()),
                (Key::from(2u64), "two".to_string()),
            ])
            .await
            .unwrap();
        chain.delete(&Key::from(1u64)).await.unwrap();

        assert!(!a.contains(&Key::from("1")).await.unwrap());
        assert!(!b.contains(&Key::from("1")).await.unwrap());
        assert_eq!(chain.get(&Key::from(2u64)).await.unwrap(), Some("two".to_string()));

        chain.delete_batch(&[Key::from(2u64)]).await.unwrap();
        assert!(a.is_empty() && b.is_empty());
    }

    #[tokio::test]
    async fn test_encoded_last_tier() {
        let backend = Arc::new(InMemoryByteBackend::new());
        let front = memory::<Vec<u32>>();
        let settings = Settings::named("encoded");
        let durable: SharedStore<Vec<u32>> =
            Arc::new(kvchain::EncodedStore::new(backend.clone(), &settings));

        let chain = ChainStore::builder(settings)
            .tier_store(front.clone())
            .tier_store(durable)
            .build()
            .unwrap();

        chain.put(&Key::from("list"), &vec![1, 2, 3]).await.unwrap();
        front.clear();

        assert_eq!(chain.get(&Key::from("list")).await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(front.len(), 1);
        assert_eq!(backend.stats().object_count, 1);
    }
}

// =============================================================================
// Missing-Value Cache
// =============================================================================

mod missing_cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_get_touches_no_tier() {
        let backend = Arc::new(FlakyBackend::default());
        let mut settings = Settings::named("negative");
        settings.missing_cache_enabled = true;
        let tier: SharedStore<i32> = Arc::new(kvchain::EncodedStore::new(backend.clone(), &settings));

        let chain = ChainStore::builder(settings).tier_store(tier).build().unwrap();

        assert_eq!(chain.get(&Key::from("z")).await.unwrap(), None);
        let calls = backend.calls();
        assert!(calls > 0);

        assert_eq!(chain.get(&Key::from("z")).await.unwrap(), None);
        assert!(!chain.contains(&Key::from("z")).await.unwrap());
        let mut dest = ValueMap::new();
        assert_eq!(
            chain.get_batch(&[Key::from("z")], &mut dest).await.unwrap(),
            vec![Key::from("z")]
        );
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test]
    async fn test_custom_missing_cache() {
        let markers = memory::<()>();
        let mut settings = Settings::named("negative");
        settings.missing_cache_enabled = true;

        let chain = ChainStore::builder(settings)
            .tier_store(memory::<i32>())
            .missing_cache(markers.clone())
            .build()
            .unwrap();

        chain.get(&Key::from("gone")).await.unwrap();
        assert!(markers.contains(&Key::from("gone")).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_missing_cache() {
        let chain: ChainStore<i32> = ChainStore::builder(Settings::named("plain"))
            .tier_store(memory::<i32>())
            .missing_cache(memory::<()>())
            .build()
            .unwrap();

        assert!(chain.missing_cache().is_none());
    }
}

// =============================================================================
// Failure Handling
// =============================================================================

/// Byte backend that can be switched into failing every call
#[derive(Default)]
struct FlakyBackend {
    inner: InMemoryByteBackend,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyBackend {
    fn failing() -> Arc<Self> {
        let backend = Self::default();
        backend.failing.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Backend("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ByteBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.enter()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.enter()?;
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.enter()?;
        self.inner.delete(key).await
    }

    fn name(&self) -> &str {
        "FlakyBackend"
    }
}

mod failure_tests {
    use super::*;
    use assert_matches::assert_matches;

    fn encoded(backend: Arc<FlakyBackend>) -> SharedStore<i32> {
        Arc::new(kvchain::EncodedStore::new(backend, &Settings::named("flaky")))
    }

    #[tokio::test]
    async fn test_failing_cache_tier_is_transparent() {
        let durable = memory::<i32>();
        let chain = ChainStore::builder(Settings::named("flaky"))
            .tier_store(encoded(FlakyBackend::failing()))
            .tier_store(durable.clone())
            .build()
            .unwrap();

        chain.put(&Key::from("k"), &1).await.unwrap();
        assert_eq!(chain.get(&Key::from("k")).await.unwrap(), Some(1));
        assert!(chain.contains(&Key::from("k")).await.unwrap());

        let mut dest = ValueMap::new();
        assert!(chain.get_batch(&[Key::from("k")], &mut dest).await.unwrap().is_empty());

        chain.delete(&Key::from("k")).await.unwrap();
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_failing_last_tier_is_fatal() {
        let front = memory::<i32>();
        let chain = ChainStore::builder(Settings::named("flaky"))
            .tier_store(front.clone())
            .tier_store(encoded(FlakyBackend::failing()))
            .build()
            .unwrap();

        let err = chain.put(&Key::from("k"), &1).await.unwrap_err();
        assert_matches!(&err, Error::Tier { op: "put", tier, .. } if tier == "EncodedStore");
        assert!(err.to_string().contains("connection refused"));

        // A hit in the front tier never reaches the failing tier
        assert_eq!(chain.get(&Key::from("k")).await.unwrap(), Some(1));

        assert_matches!(chain.get(&Key::from("miss")).await, Err(Error::Tier { .. }));
        assert_matches!(
            chain.get_batch(&[Key::from("a")], &mut ValueMap::new()).await,
            Err(Error::Tier { .. })
        );

        // The front tier is cleared before the last tier fails
        assert_matches!(chain.delete(&Key::from("k")).await, Err(Error::Tier { .. }));
        assert!(front.is_empty());
    }

    #[tokio::test]
    async fn test_failing_last_tier_does_not_mark_missing() {
        let backend = FlakyBackend::failing();
        let mut settings = Settings::named("flaky");
        settings.missing_cache_enabled = true;
        let chain = ChainStore::builder(settings)
            .tier_store(encoded(backend.clone()))
            .build()
            .unwrap();

        assert!(chain.get(&Key::from("k")).await.is_err());
        backend.failing.store(false, Ordering::SeqCst);

        let before = backend.calls();
        assert_eq!(chain.get(&Key::from("k")).await.unwrap(), None);
        assert!(backend.calls() > before);
    }

    #[tokio::test]
    async fn test_invalid_keys_are_caller_errors() {
        let chain = ChainStore::builder(Settings::named("keys"))
            .tier_store(memory::<i32>())
            .build()
            .unwrap();

        let err = chain.get(&Key::from(2.5f64)).await.unwrap_err();
        assert!(err.is_key_error());
        assert_matches!(
            chain.get_batch(&[Key::from("a"), Key::Nil], &mut ValueMap::new()).await,
            Err(Error::InvalidKey { .. })
        );
    }
}

// =============================================================================
// Assembly From Configuration
// =============================================================================

mod config_tests {
    use super::*;
    use assert_matches::assert_matches;
    use kvchain::{ChainConfig, StoreRegistry};

    const CONFIG: &str = r#"
model_id:
  project: shop
  environment: test
  family: catalog
  application: api
  name: products
elements: [inMemory, ddb]
ttl: 10m
batch_size: 2
missing_cache_enabled: true
"#;

    #[tokio::test]
    async fn test_chain_from_yaml() {
        let backend = Arc::new(InMemoryByteBackend::new());
        let mut registry = StoreRegistry::<String>::new();
        registry.register_backend("ddb", backend.clone());

        let config = ChainConfig::from_yaml(CONFIG).unwrap();
        let chain = registry.build(&config).unwrap();

        assert_eq!(chain.tiers().len(), 2);
        assert_eq!(chain.settings().batch_size, 2);

        let values: Vec<(Key, String)> = (0..5).map(|i| (Key::from(i), format!("p{}", i))).collect();
        chain.put_batch(&values).await.unwrap();
        assert_eq!(backend.stats().object_count, 5);
        assert!(backend.raw("kvstore-products-3").is_some());

        let keys: Vec<Key> = (0..7).map(Key::from).collect();
        let mut dest = ValueMap::new();
        let missing = chain.get_batch(&keys, &mut dest).await.unwrap();

        assert_eq!(dest.len(), 5);
        assert_eq!(missing, vec![Key::from(5), Key::from(6)]);
    }

    #[test]
    fn test_unknown_element_from_yaml() {
        let registry = StoreRegistry::<String>::new();
        let config = ChainConfig::from_yaml(CONFIG).unwrap();

        assert_matches!(
            registry.build(&config),
            Err(Error::UnknownElement { element, .. }) if element == "ddb"
        );
    }
}

// =============================================================================
// Metrics
// =============================================================================

mod metrics_tests {
    use super::*;
    use kvchain::metrics::StoreMetric;
    use kvchain::PrometheusSink;

    #[tokio::test]
    async fn test_chain_records_per_tier_metrics() {
        let sink = Arc::new(PrometheusSink::new().unwrap());
        let mut settings = Settings::named("metered");
        settings.metrics_enabled = true;
        settings.missing_cache_enabled = true;

        let front = memory::<i32>();
        let back = memory::<i32>();
        back.put(&Key::from("b"), &2).await.unwrap();

        let chain = ChainStore::builder(settings)
            .tier_store(front)
            .tier_store(back)
            .metrics_sink(sink.clone())
            .build()
            .unwrap();

        assert_eq!(chain.get(&Key::from("b")).await.unwrap(), Some(2));
        assert_eq!(chain.get(&Key::from("b")).await.unwrap(), Some(2));
        assert_eq!(chain.get(&Key::from("z")).await.unwrap(), None);

        let model = "....metered";
        // Both tiers are InMemoryStore and share one series
        assert_eq!(sink.value(StoreMetric::Read, model, "InMemoryStore").unwrap(), 5);
        assert_eq!(sink.value(StoreMetric::Hit, model, "InMemoryStore").unwrap(), 2);
        assert_eq!(sink.value(StoreMetric::Write, model, "InMemoryStore").unwrap(), 1);

        let markers = "....metered-missingCache";
        assert_eq!(sink.value(StoreMetric::Read, markers, "InMemoryStore").unwrap(), 3);
        assert_eq!(sink.value(StoreMetric::Write, markers, "InMemoryStore").unwrap(), 1);

        let text = sink.render().unwrap();
        assert!(text.contains("kvstore_read_total"));
    }
}
