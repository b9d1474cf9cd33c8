//! In-Memory Store
//!
//! Process-local tier with per-entry TTL and a bounded item count. Also used
//! as the chain's missing-value cache.
//!
//! # Design
//!
//! - DashMap storage for concurrent access without a global lock
//! - Expired entries read as misses and are dropped on access
//! - When the item count exceeds `max_size`, one pruner at a time removes
//!   expired entries first, then the least recently accessed ones

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::batch::{get_batch, ChunkFetch};
use super::key::{normalize, Key};
use super::{InMemorySettings, KvStore, Settings, SizedStore, ValueMap, DEFAULT_TTL, MAX_TTL};
use crate::error::Result;

struct Slot<T> {
    value: T,
    expires_at: Instant,
    last_access: AtomicU64,
}

impl<T> Slot<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory tier with TTL and size-bounded pruning
pub struct InMemoryStore<T> {
    /// Entries keyed by normalized key
    storage: DashMap<String, Slot<T>>,
    /// Entry lifetime
    ttl: Duration,
    /// Keys per batch chunk
    batch_size: usize,
    /// Size bound and prune batch
    limits: InMemorySettings,
    /// Logical access clock for recency ordering
    clock: AtomicU64,
    /// Serializes prune passes
    prune_guard: Mutex<()>,
    /// Number of pruned entries
    evictions: AtomicU64,
}

impl<T> InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a store from chain settings
    pub fn new(settings: &Settings) -> Self {
        let mut limits = settings.in_memory.clone();
        if limits.max_size == 0 {
            limits.max_size = super::DEFAULT_IN_MEMORY_MAX_SIZE;
        }
        if limits.items_to_prune == 0 {
            limits.items_to_prune = (limits.max_size / 10).max(1);
        }

        Self {
            storage: DashMap::new(),
            ttl: settings.effective_ttl(),
            batch_size: settings.effective_batch_size(),
            limits,
            clock: AtomicU64::new(0),
            prune_guard: Mutex::new(()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create a store with the given TTL and default limits
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(&Settings {
            ttl,
            ..Settings::default()
        })
    }

    /// Number of entries currently held, including not yet dropped expired ones
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Number of entries removed by pruning
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.storage.clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn read(&self, key: &str) -> Option<T> {
        let now = Instant::now();

        if let Some(slot) = self.storage.get(key) {
            if !slot.is_expired(now) {
                slot.last_access.store(self.tick(), Ordering::Relaxed);
                return Some(slot.value.clone());
            }
        } else {
            return None;
        }

        self.storage.remove_if(key, |_, slot| slot.is_expired(now));
        None
    }

    /// Expiry for an entry written now; lifetimes beyond [`MAX_TTL`] are capped
    fn expiry(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.ttl.min(MAX_TTL))
            .or_else(|| now.checked_add(DEFAULT_TTL))
            .unwrap_or(now)
    }

    fn write(&self, key: String, value: T) {
        let slot = Slot {
            value,
            expires_at: self.expiry(),
            last_access: AtomicU64::new(self.tick()),
        };
        self.storage.insert(key, slot);

        if self.storage.len() > self.limits.max_size {
            self.prune();
        }
    }

    /// Drop expired entries, then the least recently accessed ones
    fn prune(&self) {
        let Some(_guard) = self.prune_guard.try_lock() else {
            return;
        };

        let now = Instant::now();
        let before = self.storage.len();
        self.storage.retain(|_, slot| !slot.is_expired(now));
        let mut pruned = before.saturating_sub(self.storage.len());

        if self.storage.len() > self.limits.max_size {
            let mut candidates: Vec<(String, u64)> = self
                .storage
                .iter()
                .map(|e| (e.key().clone(), e.value().last_access.load(Ordering::Relaxed)))
                .collect();
            candidates.sort_by_key(|(_, access)| *access);

            for (key, _) in candidates.into_iter().take(self.limits.items_to_prune) {
                if self.storage.remove(&key).is_some() {
                    pruned += 1;
                }
            }
        }

        self.evictions.fetch_add(pruned as u64, Ordering::Relaxed);
    }

    async fn get_chunk(&self, chunk: Vec<String>) -> Result<ChunkFetch<T>> {
        let mut fetched = ChunkFetch::default();

        for key in chunk {
            match self.read(&key) {
                Some(value) => fetched.found.push((key, value)),
                None => fetched.missing.push(key),
            }
        }

        Ok(fetched)
    }
}

#[async_trait]
impl<T> KvStore<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn contains(&self, key: &Key) -> Result<bool> {
        let key = normalize(key)?;
        Ok(self.read(&key).is_some())
    }

    async fn get(&self, key: &Key) -> Result<Option<T>> {
        let key = normalize(key)?;
        Ok(self.read(&key))
    }

    async fn get_batch(&self, keys: &[Key], dest: &mut ValueMap<T>) -> Result<Vec<Key>> {
        get_batch(keys, dest, self.batch_size, |chunk| self.get_chunk(chunk)).await
    }

    async fn put(&self, key: &Key, value: &T) -> Result<()> {
        let key = normalize(key)?;
        self.write(key, value.clone());
        Ok(())
    }

    async fn put_batch(&self, values: &[(Key, T)]) -> Result<()> {
        for (key, value) in values {
            self.put(key, value).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let key = normalize(key)?;
        self.storage.remove(&key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[Key]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "InMemoryStore"
    }

    fn sized(&self) -> Option<&dyn SizedStore> {
        Some(self)
    }
}

impl<T> SizedStore for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn estimate_size(&self) -> Option<u64> {
        Some(self.storage.len() as u64)
    }
}

// =============================================================================
// Tests
// =============================================================================
