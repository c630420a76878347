// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record read cache.
//!
//! Repeated reads of the same Record skip the backend round trip. Every
//! write that touches a key invalidates that key's entry before the write
//! returns, so a Record is never served stale after its own write.
//!
//! # Flow
//!
//! ```text
//! get_objects([k1, k2, k1])
//!       │
//!       ▼
//! ┌──────────────────────────────┐
//! │  get_uncached_keys           │
//! │  k1 → hit  (into result map) │
//! │  k2 → miss (to fetch list)   │
//! └──────────────────────────────┘
//!       │
//!       ├─→ all hits → zip result map by input position
//!       │
//!       └─→ fetch [k2] in one backend call, cache it (null marker if
//!           absent), zip result map by input position
//! ```
//!
//! The cache is best effort. A [`RecordCache`] may fail (a remote cache can
//! be unreachable); [`CacheLayer`] logs the failure, treats it as a miss and
//! carries on. Cache failures never fail a read or a write.
//!
//! The cache is a value you construct and hand to the stores, never a
//! global, so tests can swap in [`NoopCache`] or a failing implementation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::metrics;
use crate::Record;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Cached answer. `None` is a cached "no such record".
    Hit(Option<Record>),
    Miss,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

/// Storage behind the cache layer. Synchronous: a lookup never suspends.
pub trait RecordCache: Send + Sync {
    fn get(&self, key: &str) -> Result<CacheLookup, CacheError>;
    fn set(&self, key: &str, value: Option<Record>, ttl: Option<Duration>) -> Result<(), CacheError>;
    fn del(&self, keys: &[String]) -> Result<(), CacheError>;

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Option<Record>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bounded in-process cache with oldest-first eviction and optional TTL.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    /// Insertion order for eviction (oldest first). May hold keys that were
    /// since invalidated; those are skipped on eviction and dropped on
    /// compaction.
    order: Mutex<VecDeque<String>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().clear();
    }

    fn evict_for_insert(&self, order: &mut VecDeque<String>) {
        while self.entries.len() >= self.max_entries {
            match order.pop_front() {
                Some(old_key) => {
                    self.entries.remove(&old_key);
                }
                None => break,
            }
        }
    }

    fn compact_order(&self, order: &mut VecDeque<String>) {
        let mut seen = HashSet::with_capacity(self.entries.len());
        order.retain(|k| self.entries.contains_key(k) && seen.insert(k.clone()));
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl RecordCache for MemoryCache {
    fn get(&self, key: &str) -> Result<CacheLookup, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheLookup::Hit(entry.value.clone()));
            }
            drop(entry); // Release read lock before removing
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(CacheLookup::Miss)
    }

    fn set(&self, key: &str, value: Option<Record>, ttl: Option<Duration>) -> Result<(), CacheError> {
        if self.max_entries == 0 {
            return Ok(());
        }
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };

        let mut order = self.order.lock();
        let is_new = !self.entries.contains_key(key);
        if is_new {
            self.evict_for_insert(&mut order);
            order.push_back(key.to_string());
            if order.len() > self.max_entries.saturating_mul(2) {
                self.compact_order(&mut order);
            }
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn del(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            entry_count: self.entries.len(),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Cache that never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl RecordCache for NoopCache {
    fn get(&self, _key: &str) -> Result<CacheLookup, CacheError> {
        Ok(CacheLookup::Miss)
    }

    fn set(&self, _key: &str, _value: Option<Record>, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Ok(())
    }

    fn del(&self, _keys: &[String]) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Collection-aware, failure-tolerant handle the stores talk to.
#[derive(Clone)]
pub struct CacheLayer {
    inner: Arc<dyn RecordCache>,
    canonical_collection: Arc<str>,
    ttl: Option<Duration>,
}

impl CacheLayer {
    pub fn new(inner: Arc<dyn RecordCache>, canonical_collection: &str, ttl: Option<Duration>) -> Self {
        Self {
            inner,
            canonical_collection: Arc::from(canonical_collection),
            ttl,
        }
    }

    /// A layer that caches nothing.
    pub fn disabled(canonical_collection: &str) -> Self {
        Self::new(Arc::new(NoopCache), canonical_collection, None)
    }

    /// `collection:key`, or the bare key for the canonical collection.
    #[must_use]
    pub fn cache_key(&self, collection: &str, key: &str) -> String {
        if collection == &*self.canonical_collection {
            key.to_string()
        } else {
            format!("{}:{}", collection, key)
        }
    }

    pub fn get(&self, collection: &str, key: &str) -> CacheLookup {
        let lookup = match self.inner.get(&self.cache_key(collection, key)) {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(collection, key, error = %e, "Cache get failed, bypassing");
                metrics::record_cache_error("get");
                CacheLookup::Miss
            }
        };
        metrics::record_cache_lookup(matches!(lookup, CacheLookup::Hit(_)));
        lookup
    }

    pub fn set(&self, collection: &str, key: &str, value: Option<Record>) {
        if let Err(e) = self.inner.set(&self.cache_key(collection, key), value, self.ttl) {
            warn!(collection, key, error = %e, "Cache set failed, ignoring");
            metrics::record_cache_error("set");
        }
    }

    /// Invalidate every listed key. The only invalidation path: every write
    /// in the stores ends here for each key it touched.
    pub fn del<S: AsRef<str>>(&self, collection: &str, keys: &[S]) {
        if keys.is_empty() {
            return;
        }
        let cache_keys: Vec<String> = keys.iter().map(|k| self.cache_key(collection, k.as_ref())).collect();
        if let Err(e) = self.inner.del(&cache_keys) {
            warn!(collection, count = cache_keys.len(), error = %e, "Cache invalidation failed");
            metrics::record_cache_error("del");
        }
    }

    /// Split `keys` into cache hits, written to `resolved`, and the keys
    /// still to fetch, returned in input order without repeats.
    pub fn get_uncached_keys(
        &self,
        collection: &str,
        keys: &[String],
        resolved: &mut HashMap<String, Option<Record>>,
    ) -> Vec<String> {
        let mut unresolved = Vec::new();
        let mut pending = HashSet::new();
        for key in keys {
            if resolved.contains_key(key) || pending.contains(key) {
                continue;
            }
            match self.get(collection, key) {
                CacheLookup::Hit(value) => {
                    resolved.insert(key.clone(), value);
                }
                CacheLookup::Miss => {
                    pending.insert(key.clone());
                    unresolved.push(key.clone());
                }
            }
        }
        unresolved
    }

    pub fn stats(&self) -> CacheStats {
        let stats = self.inner.stats();
        metrics::set_cache_entries(stats.entry_count);
        stats
    }
}
