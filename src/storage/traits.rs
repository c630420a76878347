// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing-store driver contract.
//!
//! Every driver stores documents keyed by `(collection, key)` and must treat
//! that pair as unique. Field names arriving here are already encoded by
//! [`crate::codec`]; drivers never see raw caller field names.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;

/// A stored document: encoded field name → value.
pub type Document = Map<String, Value>;

/// Field holding a Set's members in document-shaped backends.
pub const MEMBERS_FIELD: &str = "members";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Duplicate key '{key}' in collection '{collection}'")]
    DuplicateKey { collection: String, key: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Invalid field name '{field}'")]
    InvalidField { field: String },
    #[error("Type mismatch on '{key}' field '{field}' in collection '{collection}'")]
    TypeMismatch {
        collection: String,
        key: String,
        field: String,
    },
}

impl StorageError {
    /// True for the uniqueness violation raised by two racing upserts.
    #[must_use]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Insert the document if absent, otherwise merge `fields` into it.
    async fn upsert(&self, collection: &str, key: &str, fields: &Document) -> Result<(), StorageError>;

    /// Unordered bulk upsert. Every entry is attempted; the first failure is
    /// reported after the rest have run.
    async fn upsert_many(&self, collection: &str, entries: &[(String, Document)]) -> Result<(), StorageError> {
        let mut first_error = None;
        for (key, fields) in entries {
            if let Err(e) = self.upsert(collection, key, fields).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fetch one document, optionally projected to `fields`.
    async fn find(
        &self,
        collection: &str,
        key: &str,
        projection: Option<&[String]>,
    ) -> Result<Option<Document>, StorageError>;

    /// Fetch many documents in one round trip. Only keys that exist are
    /// returned, in no particular order.
    async fn find_many(
        &self,
        collection: &str,
        keys: &[String],
        projection: Option<&[String]>,
    ) -> Result<Vec<(String, Document)>, StorageError>;

    /// Remove `fields` from every document in `keys`. Missing keys are skipped.
    async fn unset_fields(&self, collection: &str, keys: &[String], fields: &[String]) -> Result<(), StorageError>;

    /// Atomically add `delta` to a numeric field, creating the document and
    /// the field (from zero) when absent. Returns the post-increment value.
    async fn increment(&self, collection: &str, key: &str, field: &str, delta: i64) -> Result<i64, StorageError>;

    /// Unordered bulk increment: `(key, [(field, delta)])`.
    async fn increment_many(
        &self,
        collection: &str,
        entries: &[(String, Vec<(String, i64)>)],
    ) -> Result<(), StorageError> {
        let mut first_error = None;
        for (key, deltas) in entries {
            for (field, delta) in deltas {
                if let Err(e) = self.increment(collection, key, field, *delta).await {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), StorageError>;

    /// Existence per key, aligned with `keys`.
    async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, StorageError>;

    /// Set-union `members` into every Set in `keys`, creating absent Sets.
    async fn set_add(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError>;

    /// Remove every occurrence of `members` from every Set in `keys`.
    async fn set_remove(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError>;

    /// Remove and return one uniformly chosen member in a single atomic
    /// step. `None` when the Set is absent or empty.
    async fn set_pop(&self, collection: &str, key: &str) -> Result<Option<String>, StorageError>;

    /// Members of the Sets that exist among `keys`.
    async fn set_members(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, Vec<String>)>, StorageError>;

    /// The subset of `keys` whose Set contains `member`.
    async fn sets_containing(&self, collection: &str, keys: &[String], member: &str) -> Result<Vec<String>, StorageError>;

    /// Cardinality of the Sets that exist among `keys`.
    async fn set_counts(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, usize)>, StorageError>;
}

/// Reject field names a document database reserves: empty names, any '.'
/// (sub-document path) and a leading '$' (operator prefix).
pub fn check_field_name(field: &str) -> Result<(), StorageError> {
    if field.is_empty() || field.contains('.') || field.starts_with('$') {
        return Err(StorageError::InvalidField { field: field.to_string() });
    }
    Ok(())
}

/// Keep only the projected fields that are present in `doc`.
#[must_use]
pub fn project(doc: Document, fields: &[String]) -> Document {
    let mut doc = doc;
    fields
        .iter()
        .filter_map(|f| doc.remove(f).map(|v| (f.clone(), v)))
        .collect()
}

/// Read the member list of a Set document.
pub fn members_of(doc: &Document, collection: &str, key: &str) -> Result<Vec<String>, StorageError> {
    match doc.get(MEMBERS_FIELD) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect()),
        Some(_) => Err(StorageError::TypeMismatch {
            collection: collection.to_string(),
            key: key.to_string(),
            field: MEMBERS_FIELD.to_string(),
        }),
    }
}

/// Union `members` into a Set document, keeping first-seen order.
pub fn add_members(doc: &mut Document, collection: &str, key: &str, members: &[String]) -> Result<(), StorageError> {
    let mut current = members_of(doc, collection, key)?;
    let mut seen: HashSet<String> = current.iter().cloned().collect();
    for m in members {
        if seen.insert(m.clone()) {
            current.push(m.clone());
        }
    }
    doc.insert(
        MEMBERS_FIELD.to_string(),
        Value::Array(current.into_iter().map(Value::String).collect()),
    );
    Ok(())
}

/// Pull every occurrence of `members` from a Set document.
pub fn remove_members(doc: &mut Document, collection: &str, key: &str, members: &[String]) -> Result<(), StorageError> {
    if !doc.contains_key(MEMBERS_FIELD) {
        return Ok(());
    }
    let drop: HashSet<&String> = members.iter().collect();
    let kept: Vec<Value> = members_of(doc, collection, key)?
        .into_iter()
        .filter(|m| !drop.contains(m))
        .map(Value::String)
        .collect();
    doc.insert(MEMBERS_FIELD.to_string(), Value::Array(kept));
    Ok(())
}

/// Remove one member of a Set document at an index drawn from the OS
/// random source.
pub fn take_random_member(doc: &mut Document, collection: &str, key: &str) -> Result<Option<String>, StorageError> {
    let mut members = members_of(doc, collection, key)?;
    if members.is_empty() {
        return Ok(None);
    }
    let member = members.swap_remove(OsRng.gen_range(0..members.len()));
    doc.insert(
        MEMBERS_FIELD.to_string(),
        Value::Array(members.into_iter().map(Value::String).collect()),
    );
    Ok(Some(member))
}

/// Apply `delta` to a numeric field of a document, treating absent or null
/// as zero.
pub fn apply_increment(
    doc: &mut Document,
    collection: &str,
    key: &str,
    field: &str,
    delta: i64,
) -> Result<i64, StorageError> {
    let current = match doc.get(field) {
        None | Some(Value::Null) => 0,
        Some(v) => v.as_i64().ok_or_else(|| StorageError::TypeMismatch {
            collection: collection.to_string(),
            key: key.to_string(),
            field: field.to_string(),
        })?,
    };
    let next = current.checked_add(delta).ok_or_else(|| {
        StorageError::Backend(format!("Increment overflow on '{}' field '{}'", key, field))
    })?;
    doc.insert(field.to_string(), Value::from(next));
    Ok(next)
}

/// Deduplicate keys preserving first occurrence, dropping empty keys.
#[must_use]
pub fn distinct_keys<S: AsRef<str>>(keys: &[S]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter()
        .map(AsRef::as_ref)
        .filter(|k| !k.is_empty() && seen.insert(*k))
        .map(str::to_string)
        .collect()
}
