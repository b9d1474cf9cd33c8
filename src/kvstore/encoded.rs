//! Encoded Stores
//!
//! Tiers living outside the process (a distributed cache, a durable store)
//! exchange raw bytes. [`EncodedStore`] adapts any [`ByteBackend`] to the
//! typed [`KvStore`] contract through a [`Codec`].
//!
//! # Design
//!
//! - Backends only see prefixed string keys and opaque bytes
//! - Multi-key backend methods have per-key default implementations, so a
//!   backend only overrides them when it has native batch commands
//! - Decoding failures are failures of the tier, not misses

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::batch::{get_batch, ChunkFetch};
use super::key::{normalize, Key};
use super::{KvStore, Settings, SizedStore, ValueMap};
use crate::error::{Error, Result};

/// Raw byte storage backend
#[async_trait]
pub trait ByteBackend: Send + Sync {
    /// Get the bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store bytes under `key`
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if `key` exists
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Get many keys; the result is positionally aligned with `keys`
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Store many entries
    async fn put_many(&self, entries: Vec<(String, Bytes)>) -> Result<()> {
        try_join_all(entries.into_iter().map(|(key, data)| async move { self.put(&key, data).await })).await?;
        Ok(())
    }

    /// Delete many keys
    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        try_join_all(keys.iter().map(|key| self.delete(key))).await?;
        Ok(())
    }

    /// Number of stored objects, if the backend can tell
    fn object_count(&self) -> Option<u64> {
        None
    }

    /// Backend type name
    fn name(&self) -> &str;
}

/// Byte backend statistics
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    /// Total objects stored
    pub object_count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

/// In-memory byte backend for testing and local development
#[derive(Default)]
pub struct InMemoryByteBackend {
    storage: DashMap<String, Bytes>,
    object_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryByteBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Get backend statistics
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            object_count: self.object_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Raw bytes under `key`, bypassing statistics
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.storage.get(key).map(|data| data.clone())
    }
}

#[async_trait]
impl ByteBackend for InMemoryByteBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.get(key).map(|data| data.clone()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let size = data.len() as u64;
        match self.storage.insert(key.to_string(), data) {
            Some(old) => {
                let old_size = old.len() as u64;
                if size > old_size {
                    self.total_bytes.fetch_add(size - old_size, Ordering::Relaxed);
                } else {
                    self.total_bytes.fetch_sub(old_size - size, Ordering::Relaxed);
                }
            }
            None => {
                self.object_count.fetch_add(1, Ordering::Relaxed);
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);

        if let Some((_, data)) = self.storage.remove(key) {
            self.object_count.fetch_sub(1, Ordering::Relaxed);
            self.total_bytes.fetch_sub(data.len() as u64, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.contains_key(key))
    }

    fn object_count(&self) -> Option<u64> {
        Some(self.object_count.load(Ordering::Relaxed))
    }

    fn name(&self) -> &str {
        "InMemoryByteBackend"
    }
}

// =============================================================================
// Codecs
// =============================================================================

/// Value (de)serialization used by encoded tiers
pub trait Codec: Send + Sync + 'static {
    /// Codec name, for error messages
    fn name(&self) -> &'static str;

    /// Encode a value
    fn encode<T: Serialize>(&self, key: &str, value: &T) -> Result<Bytes>;

    /// Decode a value
    fn decode<T: DeserializeOwned>(&self, key: &str, data: &[u8]) -> Result<T>;
}

/// JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, key: &str, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value).map(Bytes::from).map_err(|e| Error::Codec {
            codec: self.name(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| Error::Codec {
            codec: self.name(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Encoded Store
// =============================================================================

/// Typed tier over a byte backend
pub struct EncodedStore<T, B: ?Sized, C = JsonCodec> {
    backend: Arc<B>,
    codec: C,
    prefix: String,
    batch_size: usize,
    _value: PhantomData<fn() -> T>,
}

impl<T, B> EncodedStore<T, B, JsonCodec>
where
    B: ByteBackend + ?Sized,
{
    /// Create a JSON-encoded store, prefixing keys with `kvstore-<model name>-`
    pub fn new(backend: Arc<B>, settings: &Settings) -> Self {
        Self::with_codec(backend, JsonCodec, settings)
    }
}

impl<T, B, C> EncodedStore<T, B, C>
where
    B: ByteBackend + ?Sized,
    C: Codec,
{
    /// Create a store using a custom codec
    pub fn with_codec(backend: Arc<B>, codec: C, settings: &Settings) -> Self {
        Self {
            backend,
            codec,
            prefix: format!("kvstore-{}-", settings.model_id.name),
            batch_size: settings.effective_batch_size(),
            _value: PhantomData,
        }
    }

    /// Replace the key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Backend key for a normalized key
    pub fn backend_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl<T, B, C> EncodedStore<T, B, C>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    B: ByteBackend + ?Sized,
    C: Codec,
{
    async fn get_chunk(&self, chunk: Vec<String>) -> Result<ChunkFetch<T>> {
        let backend_keys: Vec<String> = chunk.iter().map(|k| self.backend_key(k)).collect();
        let values = self.backend.get_many(&backend_keys).await?;
        if values.len() != chunk.len() {
            return Err(Error::Backend(format!(
                "{} returned {} values for {} keys",
                self.backend.name(),
                values.len(),
                chunk.len()
            )));
        }

        let mut fetched = ChunkFetch::default();
        for (key, data) in chunk.into_iter().zip(values) {
            match data {
                Some(data) => {
                    let value = self.codec.decode(&key, &data)?;
                    fetched.found.push((key, value));
                }
                None => fetched.missing.push(key),
            }
        }

        Ok(fetched)
    }
}

#[async_trait]
impl<T, B, C> KvStore<T> for EncodedStore<T, B, C>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    B: ByteBackend + ?Sized,
    C: Codec,
{
    async fn contains(&self, key: &Key) -> Result<bool> {
        let key = normalize(key)?;
        self.backend.exists(&self.backend_key(&key)).await
    }

    async fn get(&self, key: &Key) -> Result<Option<T>> {
        let key = normalize(key)?;
        match self.backend.get(&self.backend_key(&key)).await? {
            Some(data) => Ok(Some(self.codec.decode(&key, &data)?)),
            None => Ok(None),
        }
    }

    async fn get_batch(&self, keys: &[Key], dest: &mut ValueMap<T>) -> Result<Vec<Key>> {
        get_batch(keys, dest, self.batch_size, |chunk| self.get_chunk(chunk)).await
    }

    async fn put(&self, key: &Key, value: &T) -> Result<()> {
        let key = normalize(key)?;
        let data = self.codec.encode(&key, value)?;
        self.backend.put(&self.backend_key(&key), data).await
    }

    async fn put_batch(&self, values: &[(Key, T)]) -> Result<()> {
        let mut entries = Vec::with_capacity(values.len());
        for (key, value) in values {
            let key = normalize(key)?;
            let data = self.codec.encode(&key, value)?;
            entries.push((self.backend_key(&key), data));
        }
        self.backend.put_many(entries).await
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        let key = normalize(key)?;
        self.backend.delete(&self.backend_key(&key)).await?;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[Key]) -> Result<()> {
        let mut backend_keys = Vec::with_capacity(keys.len());
        for key in keys {
            backend_keys.push(self.backend_key(&normalize(key)?));
        }
        self.backend.delete_many(&backend_keys).await
    }

    fn name(&self) -> &str {
        "EncodedStore"
    }

    fn sized(&self) -> Option<&dyn SizedStore> {
        self.backend.object_count().map(|_| self as &dyn SizedStore)
    }
}

impl<T, B, C> SizedStore for EncodedStore<T, B, C>
where
    T: Send + Sync,
    B: ByteBackend + ?Sized,
    C: Codec,
{
    fn estimate_size(&self) -> Option<u64> {
        self.backend.object_count()
    }
}

// =============================================================================
// Tests
// =============================================================================
