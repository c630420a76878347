// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record storage: CRUD, field-level mutation and counters.
//!
//! # Read path
//!
//! ```text
//! get_objects(keys)
//!   ├─→ CacheLayer::get_uncached_keys   (hits resolved, no I/O)
//!   ├─→ Backend::find_many(unresolved)  (one round trip)
//!   ├─→ codec::deserialize_record
//!   └─→ CacheLayer::set                 (absent keys cached as null)
//! ```
//!
//! # Write path
//!
//! ```text
//! set_object(key, fields)
//!   ├─→ codec::serialize_record         (empty → no-op)
//!   ├─→ resolve_collisions(upsert)      (one retry on duplicate key)
//!   └─→ CacheLayer::del(key)            (always, before returning)
//! ```
//!
//! Empty keys and empty field lists short-circuit before the backend and
//! yield an empty result.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheLayer, CacheLookup};
use crate::codec::{deserialize_record, encode_field, encode_fields, serialize_record};
use crate::metrics;
use crate::resilience::collision::resolve_collisions;
use crate::storage::traits::{distinct_keys, Backend, Document, StorageError};
use crate::Record;

const STORE: &str = "objects";

/// Handle onto the Records of one collection.
///
/// Cloning is cheap; every clone shares the backend and the cache.
#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn Backend>,
    cache: CacheLayer,
    collection: Arc<str>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn Backend>, cache: CacheLayer, collection: &str) -> Self {
        Self {
            backend,
            cache,
            collection: Arc::from(collection),
        }
    }

    /// Same backend and cache, bound to `collection`.
    #[must_use]
    pub fn with_collection(&self, collection: &str) -> Self {
        Self {
            backend: self.backend.clone(),
            cache: self.cache.clone(),
            collection: Arc::from(collection),
        }
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn invalidate<S: AsRef<str>>(&self, keys: &[S]) {
        self.cache.del(&self.collection, keys);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // WRITES
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert `fields` into the Record at `key`, creating it if absent.
    pub async fn set_object(&self, key: &str, fields: &Record) -> Result<(), StorageError> {
        self.set_objects(&[key], fields).await
    }

    /// Upsert the same `fields` into every Record in `keys` with one bulk
    /// write.
    pub async fn set_objects<S: AsRef<str>>(&self, keys: &[S], fields: &Record) -> Result<(), StorageError> {
        let keys = distinct_keys(keys);
        let stored = serialize_record(fields);
        if keys.is_empty() || stored.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "set_object");

        let result = if let [key] = keys.as_slice() {
            resolve_collisions("set_object", || self.backend.upsert(&self.collection, key, &stored)).await
        } else {
            metrics::record_batch_size(STORE, keys.len());
            let entries: Vec<(String, Document)> = keys.iter().map(|k| (k.clone(), stored.clone())).collect();
            resolve_collisions("set_objects", || self.backend.upsert_many(&self.collection, &entries)).await
        };
        self.invalidate(&keys);
        metrics::observe(STORE, "set_object", result)
    }

    /// Upsert a different payload per key in one round trip. Entries whose
    /// key or serialized payload is empty are skipped.
    pub async fn set_object_bulk<S: AsRef<str>>(&self, entries: &[(S, Record)]) -> Result<(), StorageError> {
        let stored: Vec<(String, Document)> = entries
            .iter()
            .filter(|(key, _)| !key.as_ref().is_empty())
            .map(|(key, fields)| (key.as_ref().to_string(), serialize_record(fields)))
            .filter(|(_, fields)| !fields.is_empty())
            .collect();
        if stored.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "set_object_bulk");
        metrics::record_batch_size(STORE, stored.len());

        let result =
            resolve_collisions("set_object_bulk", || self.backend.upsert_many(&self.collection, &stored)).await;
        let touched: Vec<&str> = stored.iter().map(|(key, _)| key.as_str()).collect();
        self.invalidate(&touched);
        metrics::observe(STORE, "set_object_bulk", result)
    }

    pub async fn set_object_field(&self, key: &str, field: &str, value: Value) -> Result<(), StorageError> {
        let mut fields = Record::new();
        fields.insert(field.to_string(), value);
        self.set_object(key, &fields).await
    }

    pub async fn delete_object_field(&self, key: &str, field: &str) -> Result<(), StorageError> {
        self.delete_objects_fields(&[key], &[field]).await
    }

    pub async fn delete_object_fields<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> Result<(), StorageError> {
        self.delete_objects_fields(&[key], fields).await
    }

    /// Unset `fields` on every Record in `keys`. Records that do not exist
    /// are left absent.
    pub async fn delete_objects_fields<S: AsRef<str>, F: AsRef<str>>(
        &self,
        keys: &[S],
        fields: &[F],
    ) -> Result<(), StorageError> {
        let keys = distinct_keys(keys);
        let fields = encode_fields(fields);
        if keys.is_empty() || fields.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "delete_object_fields");

        let result = resolve_collisions("delete_object_fields", || {
            self.backend.unset_fields(&self.collection, &keys, &fields)
        })
        .await;
        self.invalidate(&keys);
        metrics::observe(STORE, "delete_object_fields", result)
    }

    /// Remove the Record at `key` entirely.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.delete_all(&[key]).await
    }

    pub async fn delete_all<S: AsRef<str>>(&self, keys: &[S]) -> Result<(), StorageError> {
        let keys = distinct_keys(keys);
        if keys.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "delete");
        let result = self.backend.delete(&self.collection, &keys).await;
        self.invalidate(&keys);
        metrics::observe(STORE, "delete", result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // COUNTERS
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn incr_object_field(&self, key: &str, field: &str) -> Result<Option<i64>, StorageError> {
        self.incr_object_field_by(key, field, 1).await
    }

    pub async fn decr_object_field(&self, key: &str, field: &str) -> Result<Option<i64>, StorageError> {
        self.incr_object_field_by(key, field, -1).await
    }

    /// Atomically add `delta` to `field`, creating the Record and the field
    /// (from zero) if absent. Returns the post-increment value as seen by
    /// this call.
    pub async fn incr_object_field_by(&self, key: &str, field: &str, delta: i64) -> Result<Option<i64>, StorageError> {
        if key.is_empty() || field.is_empty() {
            return Ok(None);
        }
        let _timer = crate::time_operation!(STORE, "incr_object_field");
        let encoded = encode_field(field);

        let result = resolve_collisions("incr_object_field", || {
            self.backend.increment(&self.collection, key, &encoded, delta)
        })
        .await;
        self.invalidate(&[key]);
        metrics::observe(STORE, "incr_object_field", result).map(Some)
    }

    /// Increment by a dynamically typed delta. Accepts a JSON integer or a
    /// string holding one; anything else returns `None` without writing.
    pub async fn incr_object_field_by_value(
        &self,
        key: &str,
        field: &str,
        delta: &Value,
    ) -> Result<Option<i64>, StorageError> {
        let parsed = match delta {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        match parsed {
            Some(delta) => self.incr_object_field_by(key, field, delta).await,
            None => {
                debug!(key, field, %delta, "Rejected non-integer increment");
                Ok(None)
            }
        }
    }

    /// Add `delta` to `field` on every Record in `keys`, then read the
    /// values back.
    ///
    /// The read-back is a separate query: under concurrent increments on the
    /// same key the returned value may include other callers' deltas. Use
    /// [`incr_object_field_by`](Self::incr_object_field_by) when the exact
    /// post-increment value matters.
    pub async fn incr_objects_field_by<S: AsRef<str>>(
        &self,
        keys: &[S],
        field: &str,
        delta: i64,
    ) -> Result<Vec<Option<i64>>, StorageError> {
        let distinct = distinct_keys(keys);
        if distinct.is_empty() || field.is_empty() {
            return Ok(vec![None; keys.len()]);
        }
        let _timer = crate::time_operation!(STORE, "incr_objects_field");
        metrics::record_batch_size(STORE, distinct.len());
        let encoded = encode_field(field);

        let entries: Vec<(String, Vec<(String, i64)>)> = distinct
            .iter()
            .map(|k| (k.clone(), vec![(encoded.clone(), delta)]))
            .collect();
        let result = resolve_collisions("incr_objects_field", || {
            self.backend.increment_many(&self.collection, &entries)
        })
        .await;
        self.invalidate(&distinct);
        metrics::observe(STORE, "incr_objects_field", result)?;

        let projection = [encoded.clone()];
        let values: HashMap<String, i64> = self
            .backend
            .find_many(&self.collection, &distinct, Some(&projection))
            .await?
            .into_iter()
            .filter_map(|(key, doc)| doc.get(&encoded).and_then(Value::as_i64).map(|v| (key, v)))
            .collect();

        Ok(keys.iter().map(|k| values.get(k.as_ref()).copied()).collect())
    }

    /// Apply a different set of `(field, delta)` increments per key in one
    /// bulk operation.
    pub async fn incr_object_field_by_bulk<S: AsRef<str>, F: AsRef<str>>(
        &self,
        entries: &[(S, Vec<(F, i64)>)],
    ) -> Result<(), StorageError> {
        let stored: Vec<(String, Vec<(String, i64)>)> = entries
            .iter()
            .filter(|(key, _)| !key.as_ref().is_empty())
            .map(|(key, deltas)| {
                let deltas: Vec<(String, i64)> = deltas
                    .iter()
                    .filter(|(field, _)| !field.as_ref().is_empty())
                    .map(|(field, delta)| (encode_field(field.as_ref()), *delta))
                    .collect();
                (key.as_ref().to_string(), deltas)
            })
            .filter(|(_, deltas)| !deltas.is_empty())
            .collect();
        if stored.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "incr_object_field_bulk");
        metrics::record_batch_size(STORE, stored.len());

        let result = resolve_collisions("incr_object_field_bulk", || {
            self.backend.increment_many(&self.collection, &stored)
        })
        .await;
        let touched: Vec<&str> = stored.iter().map(|(key, _)| key.as_str()).collect();
        self.invalidate(&touched);
        metrics::observe(STORE, "incr_object_field_bulk", result)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READS
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_object(&self, key: &str) -> Result<Option<Record>, StorageError> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.get_objects(&[key]).await?.pop().flatten())
    }

    /// Only the requested `fields`, missing ones set to null. An absent
    /// Record yields every field null; empty `fields` means the whole Record.
    pub async fn get_object_fields<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> Result<Option<Record>, StorageError> {
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.get_objects_fields(&[key], fields).await?.pop().flatten())
    }

    /// Records aligned with `keys`. Cache hits are served without I/O; the
    /// rest are fetched in one backend call and cached, absent keys
    /// included.
    pub async fn get_objects<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<Option<Record>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let _timer = crate::time_operation!(STORE, "get_objects");
        let wanted = distinct_keys(keys);

        let mut resolved: HashMap<String, Option<Record>> = HashMap::with_capacity(wanted.len());
        let unresolved = self.cache.get_uncached_keys(&self.collection, &wanted, &mut resolved);

        if !unresolved.is_empty() {
            metrics::record_batch_size(STORE, unresolved.len());
            let found = self.backend.find_many(&self.collection, &unresolved, None).await;
            let mut found: HashMap<String, Document> = metrics::observe(STORE, "get_objects", found)?.into_iter().collect();
            debug!(
                collection = %self.collection,
                cached = resolved.len(),
                fetched = unresolved.len(),
                found = found.len(),
                "Fetched uncached records"
            );
            for key in unresolved {
                let record = found.remove(&key).map(deserialize_record);
                self.cache.set(&self.collection, &key, record.clone());
                resolved.insert(key, record);
            }
        }

        Ok(keys
            .iter()
            .map(|k| resolved.get(k.as_ref()).cloned().flatten())
            .collect())
    }

    /// Field-projected [`get_objects`](Self::get_objects). With non-empty
    /// `fields` every element is `Some`, absent Records projecting to all
    /// nulls.
    pub async fn get_objects_fields<S: AsRef<str>, F: AsRef<str>>(
        &self,
        keys: &[S],
        fields: &[F],
    ) -> Result<Vec<Option<Record>>, StorageError> {
        let records = self.get_objects(keys).await?;
        let fields: Vec<&str> = fields.iter().map(AsRef::as_ref).filter(|f| !f.is_empty()).collect();
        if fields.is_empty() {
            return Ok(records);
        }
        Ok(records
            .into_iter()
            .map(|record| {
                let record = record.unwrap_or_default();
                Some(
                    fields
                        .iter()
                        .map(|f| (f.to_string(), record.get(*f).cloned().unwrap_or(Value::Null)))
                        .collect(),
                )
            })
            .collect())
    }

    /// One field of one Record, `None` when the Record or field is absent
    /// or null. A cache miss is answered by a projected query and leaves
    /// the cache untouched.
    pub async fn get_object_field(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError> {
        if key.is_empty() || field.is_empty() {
            return Ok(None);
        }
        let value = match self.cache.get(&self.collection, key) {
            CacheLookup::Hit(record) => record.and_then(|mut r| r.remove(field)),
            CacheLookup::Miss => {
                let _timer = crate::time_operation!(STORE, "get_object_field");
                let encoded = encode_field(field);
                let projection = [encoded.clone()];
                let doc = self.backend.find(&self.collection, key, Some(&projection)).await;
                metrics::observe(STORE, "get_object_field", doc)?.and_then(|mut d| d.remove(&encoded))
            }
        };
        Ok(value.filter(|v| !v.is_null()))
    }

    pub async fn is_object_field(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        Ok(self.is_object_fields(key, &[field]).await?.first().copied().unwrap_or(false))
    }

    /// Whether each field exists and is non-null, read straight from the
    /// backend.
    pub async fn is_object_fields<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> Result<Vec<bool>, StorageError> {
        let projection = encode_fields(fields);
        if key.is_empty() || projection.is_empty() {
            return Ok(vec![false; fields.len()]);
        }
        let doc = self
            .backend
            .find(&self.collection, key, Some(&projection))
            .await?
            .unwrap_or_default();
        Ok(fields
            .iter()
            .map(|f| {
                let f = f.as_ref();
                !f.is_empty() && doc.get(&encode_field(f)).is_some_and(|v| !v.is_null())
            })
            .collect())
    }

    /// Field names of the Record, empty if absent.
    pub async fn get_object_keys(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .get_object(key)
            .await?
            .map(|r| r.into_iter().map(|(field, _)| field).collect())
            .unwrap_or_default())
    }

    pub async fn get_object_values(&self, key: &str) -> Result<Vec<Value>, StorageError> {
        Ok(self
            .get_object(key)
            .await?
            .map(|r| r.into_iter().map(|(_, value)| value).collect())
            .unwrap_or_default())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.exists_many(&[key]).await?.first().copied().unwrap_or(false))
    }

    /// Existence per key, aligned with `keys`.
    pub async fn exists_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<bool>, StorageError> {
        let distinct = distinct_keys(keys);
        if distinct.is_empty() {
            return Ok(vec![false; keys.len()]);
        }
        let flags = self.backend.exists(&self.collection, &distinct).await?;
        let present: HashMap<&str, bool> = distinct.iter().map(String::as_str).zip(flags).collect();
        Ok(keys
            .iter()
            .map(|k| present.get(k.as_ref()).copied().unwrap_or(false))
            .collect())
    }

}
