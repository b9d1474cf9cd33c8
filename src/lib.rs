//! kvchain - Tiered Key-Value Store Chain
//!
//! Composes key-value stores of different speed and durability into a single
//! store. Reads walk the tiers from fastest to slowest and promote found
//! values into the faster tiers; writes and deletes reach every tier; misses
//! can be remembered in a negative cache.
//!
//! # Architecture
//!
//! ```text
//! ChainConfig → StoreRegistry → ChainStore ─┬─ MetricStore ─ InMemoryStore
//!                                           ├─ MetricStore ─ EncodedStore ─ ByteBackend
//!                                           └─ missing-value cache
//! ```
//!
//! # Example
//!
//! ```no_run
//! use kvchain::{ChainStore, InMemoryStore, Key, KvStore, Settings, SharedStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> kvchain::Result<()> {
//! let mut settings = Settings::named("items");
//! settings.missing_cache_enabled = true;
//!
//! let chain: ChainStore<String> = ChainStore::builder(settings)
//!     .tier(|s| Ok(Arc::new(InMemoryStore::<String>::new(s)) as SharedStore<String>))
//!     .tier(|s| Ok(Arc::new(InMemoryStore::<String>::new(s)) as SharedStore<String>))
//!     .build()?;
//!
//! chain.put(&Key::from("a"), &"alpha".to_string()).await?;
//! assert_eq!(chain.get(&Key::from("a")).await?, Some("alpha".to_string()));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`kvstore`] - Store contract, chain, tiers and configuration
//! - [`metrics`] - Metric sinks
//! - [`logging`] - Subscriber setup
//! - [`error`] - Error types

pub mod error;
pub mod kvstore;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use error::{Error, Result};
pub use kvstore::{
    ChainConfig, ChainStore, EncodedStore, InMemoryStore, Key, KvStore, ModelId, Settings,
    SharedStore, StoreRegistry, ValueMap,
};
pub use logging::{init_logging, LogConfig};
pub use metrics::{MetricsSink, PrometheusSink};
