// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Record Store
//!
//! A schema-less document/set storage layer with a write-invalidated read
//! cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ObjectStore  /  SetStore                    │
//! │  • Records: Field → Value maps under a key                 │
//! │  • Sets: deduplicated string members under a key           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache Layer                           │
//! │  • Record reads short-circuit on hit                       │
//! │  • Every write invalidates the keys it touched             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Field Codec + Collision Resolver               │
//! │  • '.' and '$' in field names mapped to safe code points   │
//! │  • Duplicate-key upsert races retried once                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Backend (Memory / Redis / SQL)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use record_store::{Database, StoreConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StoreConfig {
//!         sql_url: Some("sqlite:records.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let db = Database::connect(&config).await.expect("Failed to connect");
//!
//!     let objects = db.objects();
//!     objects.set_object_field("user:1", "name", json!("Ann")).await.unwrap();
//!     let counter = objects.incr_object_field("user:1", "visits").await.unwrap();
//!     println!("visits: {:?}", counter);
//!
//!     let sets = db.sets();
//!     sets.set_add("user:1:tags", &["admin", "beta"]).await.unwrap();
//!     println!("tags: {:?}", sets.get_set_members("user:1:tags").await.unwrap());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`object_store`]: Record CRUD, field mutation, counters
//! - [`set_store`]: Set membership operations
//! - [`cache`]: Record cache and the invalidating [`CacheLayer`]
//! - [`codec`]: Field-name encoding
//! - [`storage`]: Backend drivers (Memory, Redis, SQL)
//! - [`resilience`]: Collision retry, connection retry

pub mod cache;
pub mod codec;
pub mod config;
pub mod database;
pub mod metrics;
pub mod object_store;
pub mod resilience;
pub mod set_store;
pub mod storage;

/// A Record: caller field name → JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

pub use cache::{CacheError, CacheLayer, CacheLookup, CacheStats, MemoryCache, NoopCache, RecordCache};
pub use config::StoreConfig;
pub use database::Database;
pub use metrics::LatencyTimer;
pub use object_store::ObjectStore;
pub use resilience::retry::RetryConfig;
pub use set_store::SetStore;
pub use storage::traits::{Backend, StorageError};
