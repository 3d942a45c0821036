//! Second-level cache region contract.
//!
//! A cache region is shared by every persistence context of a process and
//! must handle its own concurrency. The engine treats it as best-effort:
//! failures are logged and never fail a flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::executor::Row;
use crate::key::EntityKey;

/// A region of the second-level cache holding disassembled rows.
pub trait CacheRegion: Send + Sync {
    fn get(&self, key: &EntityKey) -> Option<Row>;

    fn put(&self, key: &EntityKey, state: &Row) -> Result<()>;

    fn evict(&self, key: &EntityKey);

    fn evict_all(&self);
}

/// Hit/miss counters of a [`MapCacheRegion`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub entries: usize,
}

/// Map-backed cache region storing rows serialized as JSON.
#[derive(Debug, Default)]
pub struct MapCacheRegion {
    entries: RwLock<HashMap<EntityKey, Vec<u8>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl MapCacheRegion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            entries: self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

impl CacheRegion for MapCacheRegion {
    fn get(&self, key: &EntityKey) -> Option<Row> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let decoded = entries
            .get(key)
            .and_then(|bytes| match serde_json::from_slice::<Row>(bytes) {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            });
        if decoded.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        decoded
    }

    fn put(&self, key: &EntityKey, state: &Row) -> Result<()> {
        let bytes = serde_json::to_vec(state).map_err(|e| Error::Cache(e.to_string()))?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), bytes);
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict(&self, key: &EntityKey) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn evict_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
