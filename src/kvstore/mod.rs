//! Tiered Key-Value Stores
//!
//! Every tier of a chain implements [`KvStore`]; the chain itself does too, so
//! chains nest.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            ChainStore<T>                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Missing-Value Cache  │  Tier 0            │ ... │  Last Tier         │
//! │  ┌────────────────┐   │ ┌────────────────┐ │     │ ┌────────────────┐ │
//! │  │ InMemoryStore  │   │ │ MetricStore    │ │     │ │ MetricStore    │ │
//! │  │ (negative TTL) │   │ │ └ InMemoryStore│ │     │ │ └ EncodedStore │ │
//! │  └────────────────┘   │ └────────────────┘ │     │ └────────────────┘ │
//! │                       │         ▲          │     │         │          │
//! │                       │         └──── promotion ─────────┘          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the last tier's failures reach the caller. Faster tiers are caches and
//! their failures are logged and treated as misses.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod batch;
pub mod chain;
pub mod config;
pub mod encoded;
pub mod in_memory;
pub mod key;
pub mod metric;
pub mod registry;

pub use batch::{get_batch, ChunkFetch};
pub use chain::{ChainStore, ChainStoreBuilder};
pub use config::{parse_duration, ChainConfig, InMemoryConfig};
pub use encoded::{ByteBackend, BackendStats, Codec, EncodedStore, InMemoryByteBackend, JsonCodec};
pub use in_memory::InMemoryStore;
pub use key::{normalize, normalize_all, Key};
pub use metric::{with_metrics, MetricStore};
pub use registry::{StoreRegistry, TierFactory};

/// Default number of keys per batch chunk
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default entry lifetime for in-memory tiers and negative markers
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Longest accepted entry lifetime
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Default maximum number of entries held by an in-memory tier
pub const DEFAULT_IN_MEMORY_MAX_SIZE: usize = 5000;

/// Destination container of batch reads, keyed by normalized key
pub type ValueMap<T> = HashMap<String, T>;

/// Shared handle to a tier
pub type SharedStore<T> = Arc<dyn KvStore<T>>;

/// Key-value store contract shared by every tier
#[async_trait]
pub trait KvStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Check whether a value is stored for `key`
    async fn contains(&self, key: &Key) -> Result<bool>;

    /// Read the value for `key`; `Ok(None)` is a miss, not a failure
    async fn get(&self, key: &Key) -> Result<Option<T>>;

    /// Read many keys into `dest`, returning the keys that were not found
    async fn get_batch(&self, keys: &[Key], dest: &mut ValueMap<T>) -> Result<Vec<Key>>;

    /// Store `value` under `key`
    async fn put(&self, key: &Key, value: &T) -> Result<()>;

    /// Store many values
    async fn put_batch(&self, values: &[(Key, T)]) -> Result<()>;

    /// Remove the value for `key`
    async fn delete(&self, key: &Key) -> Result<()>;

    /// Remove many keys
    async fn delete_batch(&self, keys: &[Key]) -> Result<()>;

    /// Type name of the store, used in logs and metric labels
    fn name(&self) -> &str;

    /// Size introspection, for stores that can estimate how much they hold
    fn sized(&self) -> Option<&dyn SizedStore> {
        None
    }
}

/// Store able to estimate the number of items it holds
pub trait SizedStore: Send + Sync {
    /// Current item count estimate, `None` if unknown right now
    fn estimate_size(&self) -> Option<u64>;
}

// =============================================================================
// Settings
// =============================================================================

/// Identity of the model a store holds, used as the `model` metric label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelId {
    pub project: String,
    pub environment: String,
    pub family: String,
    pub application: String,
    pub name: String,
}

impl ModelId {
    /// Model id with only a name set
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.project, self.environment, self.family, self.application, self.name
        )
    }
}

/// In-memory tier settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemorySettings {
    /// Maximum number of entries before pruning
    pub max_size: usize,
    /// Entries removed per prune pass (0 = max_size / 10)
    pub items_to_prune: usize,
}

impl Default for InMemorySettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_IN_MEMORY_MAX_SIZE,
            items_to_prune: DEFAULT_IN_MEMORY_MAX_SIZE / 10,
        }
    }
}

/// Settings shared by a chain and all of its tiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Model identity
    pub model_id: ModelId,
    /// Lifetime of in-memory entries and negative markers
    pub ttl: Duration,
    /// Keys per batch chunk (values below 1 are treated as 1)
    pub batch_size: usize,
    /// Cache negative lookups
    pub missing_cache_enabled: bool,
    /// Wrap tiers with the metrics decorator
    pub metrics_enabled: bool,
    /// In-memory tier settings
    pub in_memory: InMemorySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_id: ModelId::default(),
            ttl: DEFAULT_TTL,
            batch_size: DEFAULT_BATCH_SIZE,
            missing_cache_enabled: false,
            metrics_enabled: false,
            in_memory: InMemorySettings::default(),
        }
    }
}

impl Settings {
    /// Default settings for the model `name`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            model_id: ModelId::named(name),
            ..Default::default()
        }
    }

    /// Batch size clamped to at least 1
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// TTL, substituting the default when unset
    pub fn effective_ttl(&self) -> Duration {
        if self.ttl.is_zero() {
            DEFAULT_TTL
        } else {
            self.ttl
        }
    }
}
