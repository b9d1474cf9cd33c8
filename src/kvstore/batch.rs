//! Batch Executor
//!
//! Normalizes and deduplicates the keys of a batch read, splits them into
//! chunks and fetches the chunks one after another.
//!
//! # Design
//!
//! - Duplicates are fetched once; the first occurrence's key is the one
//!   reported back as missing
//! - Chunks are contiguous and keep the caller's order
//! - A failing chunk aborts the batch; tiers decide about partial failures
//!   before reporting back

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;

use super::key::{normalize_all, Key};
use super::ValueMap;
use crate::error::Result;

/// Outcome of fetching one chunk of normalized keys
#[derive(Debug)]
pub struct ChunkFetch<T> {
    /// Values found, keyed by normalized key
    pub found: Vec<(String, T)>,
    /// Normalized keys that were not found
    pub missing: Vec<String>,
}

impl<T> Default for ChunkFetch<T> {
    fn default() -> Self {
        Self {
            found: Vec::new(),
            missing: Vec::new(),
        }
    }
}

impl<T> ChunkFetch<T> {
    /// Chunk where none of the keys were found
    pub fn all_missing(missing: Vec<String>) -> Self {
        Self {
            found: Vec::new(),
            missing,
        }
    }
}

/// Deduplicated batch request: normalized keys in order plus their original keys
#[derive(Debug)]
pub(crate) struct DedupedKeys {
    pub(crate) normalized: Vec<String>,
    pub(crate) originals: HashMap<String, Key>,
}

impl DedupedKeys {
    pub(crate) fn new(keys: &[Key]) -> Result<Self> {
        let all = normalize_all(keys)?;
        let mut normalized = Vec::with_capacity(all.len());
        let mut originals = HashMap::with_capacity(all.len());

        for (key, norm) in keys.iter().zip(all) {
            if let Entry::Vacant(slot) = originals.entry(norm.clone()) {
                slot.insert(key.clone());
                normalized.push(norm);
            }
        }

        Ok(Self {
            normalized,
            originals,
        })
    }

    /// Caller-facing key for a normalized key
    pub(crate) fn original(&self, normalized: &str) -> Key {
        self.originals
            .get(normalized)
            .cloned()
            .unwrap_or_else(|| Key::Str(normalized.to_string()))
    }
}

/// Split `keys` into contiguous chunks of at most `chunk_size` (clamped to 1).
pub fn chunk_keys(keys: &[String], chunk_size: usize) -> impl Iterator<Item = &[String]> {
    keys.chunks(chunk_size.max(1))
}

/// Read `keys` chunk by chunk through `fetch_chunk`, filling `dest`.
///
/// Returns the keys no chunk produced a value for, in chunk order and in the
/// caller's original key form.
pub async fn get_batch<T, F, Fut>(
    keys: &[Key],
    dest: &mut ValueMap<T>,
    chunk_size: usize,
    mut fetch_chunk: F,
) -> Result<Vec<Key>>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<ChunkFetch<T>>>,
{
    let deduped = DedupedKeys::new(keys)?;
    let mut missing = Vec::new();

    for chunk in chunk_keys(&deduped.normalized, chunk_size) {
        let fetched = fetch_chunk(chunk.to_vec()).await?;

        dest.extend(fetched.found);
        missing.extend(fetched.missing.iter().map(|k| deduped.original(k)));
    }

    Ok(missing)
}

// =============================================================================
// Tests
// =============================================================================
