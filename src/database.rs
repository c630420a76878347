// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wiring: one backend, one cache layer, two store handles.
//!
//! ```text
//! StoreConfig ──→ Database::connect
//!                   ├─→ sql_url?   → SqlBackend
//!                   ├─→ redis_url? → RedisBackend
//!                   └─→ otherwise  → MemoryBackend
//!                 CacheLayer (MemoryCache | NoopCache)
//!                   ├─→ ObjectStore
//!                   └─→ SetStore
//! ```

use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheLayer, CacheStats, MemoryCache, RecordCache};
use crate::config::StoreConfig;
use crate::metrics;
use crate::object_store::ObjectStore;
use crate::set_store::SetStore;
use crate::storage::memory::MemoryBackend;
use crate::storage::redis::RedisBackend;
use crate::storage::sql::SqlBackend;
use crate::storage::traits::{Backend, StorageError};

/// Entry point handing out [`ObjectStore`] and [`SetStore`] handles that
/// share one backend and one cache.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn Backend>,
    cache: CacheLayer,
    default_collection: String,
}

impl Database {
    /// Build on an existing backend, caching per `config`.
    pub fn new(backend: Arc<dyn Backend>, config: &StoreConfig) -> Self {
        let cache = if config.cache_enabled {
            let inner: Arc<dyn RecordCache> = Arc::new(MemoryCache::new(config.cache_max_entries));
            CacheLayer::new(inner, &config.default_collection, config.cache_ttl())
        } else {
            CacheLayer::disabled(&config.default_collection)
        };
        Self::with_cache(backend, cache, &config.default_collection)
    }

    /// Build on an existing backend and a caller-supplied cache layer.
    pub fn with_cache(backend: Arc<dyn Backend>, cache: CacheLayer, default_collection: &str) -> Self {
        Self {
            backend,
            cache,
            default_collection: default_collection.to_string(),
        }
    }

    /// Connect the backend selected by `config`: SQL, then Redis, then
    /// in-memory.
    #[tracing::instrument(skip(config), fields(backend))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StorageError> {
        let backend: Arc<dyn Backend> = if let Some(ref sql_url) = config.sql_url {
            info!("Connecting to SQL backend...");
            Arc::new(SqlBackend::new(sql_url, config.sql_max_connections).await?)
        } else if let Some(ref redis_url) = config.redis_url {
            info!("Connecting to Redis backend...");
            Arc::new(RedisBackend::with_prefix(redis_url, config.redis_prefix.as_deref()).await?)
        } else {
            Arc::new(MemoryBackend::new())
        };

        tracing::Span::current().record("backend", backend.name());
        metrics::set_backend_healthy(backend.name(), true);
        info!(backend = backend.name(), cache = config.cache_enabled, "Record store ready");
        Ok(Self::new(backend, config))
    }

    /// In-memory backend with default settings.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), &StoreConfig::default())
    }

    /// Record store bound to the default collection.
    #[must_use]
    pub fn objects(&self) -> ObjectStore {
        ObjectStore::new(self.backend.clone(), self.cache.clone(), &self.default_collection)
    }

    /// Set store bound to the default collection.
    #[must_use]
    pub fn sets(&self) -> SetStore {
        SetStore::new(self.backend.clone(), self.cache.clone(), &self.default_collection)
    }

    #[must_use]
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}
