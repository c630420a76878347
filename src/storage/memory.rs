// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process document backend.
//!
//! Applies the same rules as a document database: `(collection, key)` is
//! unique, field names may not contain '.' or start with '$', and Sets are
//! documents carrying a `members` array.

use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::{
    add_members, apply_increment, check_field_name, members_of, project, remove_members, take_random_member, Backend,
    Document, StorageError,
};

type DocKey = (String, String);

fn doc_key(collection: &str, key: &str) -> DocKey {
    (collection.to_string(), key.to_string())
}

pub struct MemoryBackend {
    data: DashMap<DocKey, Document>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    /// Number of stored documents across all collections
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Raw stored document, bypassing every layer above the driver.
    #[must_use]
    pub fn raw(&self, collection: &str, key: &str) -> Option<Document> {
        self.data.get(&doc_key(collection, key)).map(|r| r.value().clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(&self, collection: &str, key: &str, fields: &Document) -> Result<(), StorageError> {
        for field in fields.keys() {
            check_field_name(field)?;
        }
        let mut entry = self.data.entry(doc_key(collection, key)).or_default();
        for (field, value) in fields {
            entry.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        key: &str,
        projection: Option<&[String]>,
    ) -> Result<Option<Document>, StorageError> {
        let doc = self.data.get(&doc_key(collection, key)).map(|r| r.value().clone());
        Ok(match projection {
            Some(fields) => doc.map(|d| project(d, fields)),
            None => doc,
        })
    }

    async fn find_many(
        &self,
        collection: &str,
        keys: &[String],
        projection: Option<&[String]>,
    ) -> Result<Vec<(String, Document)>, StorageError> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(doc) = self.find(collection, key, projection).await? {
                found.push((key.clone(), doc));
            }
        }
        Ok(found)
    }

    async fn unset_fields(&self, collection: &str, keys: &[String], fields: &[String]) -> Result<(), StorageError> {
        for field in fields {
            check_field_name(field)?;
        }
        for key in keys {
            if let Some(mut doc) = self.data.get_mut(&doc_key(collection, key)) {
                for field in fields {
                    doc.remove(field);
                }
            }
        }
        Ok(())
    }

    async fn increment(&self, collection: &str, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        check_field_name(field)?;
        let mut entry = self.data.entry(doc_key(collection, key)).or_default();
        apply_increment(&mut entry, collection, key, field, delta)
    }

    async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), StorageError> {
        for key in keys {
            self.data.remove(&doc_key(collection, key));
        }
        Ok(())
    }

    async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, StorageError> {
        Ok(keys
            .iter()
            .map(|k| self.data.contains_key(&doc_key(collection, k)))
            .collect())
    }

    async fn set_add(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in keys {
            let mut entry = self.data.entry(doc_key(collection, key)).or_default();
            if let Err(e) = add_members(&mut entry, collection, key, members) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn set_remove(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in keys {
            if let Some(mut doc) = self.data.get_mut(&doc_key(collection, key)) {
                if let Err(e) = remove_members(&mut doc, collection, key, members) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn set_pop(&self, collection: &str, key: &str) -> Result<Option<String>, StorageError> {
        match self.data.get_mut(&doc_key(collection, key)) {
            Some(mut doc) => take_random_member(&mut doc, collection, key),
            None => Ok(None),
        }
    }

    async fn set_members(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(doc) = self.data.get(&doc_key(collection, key)) {
                found.push((key.clone(), members_of(&doc, collection, key)?));
            }
        }
        Ok(found)
    }

    async fn sets_containing(&self, collection: &str, keys: &[String], member: &str) -> Result<Vec<String>, StorageError> {
        let members = self.set_members(collection, keys).await?;
        Ok(members
            .into_iter()
            .filter(|(_, m)| m.iter().any(|x| x == member))
            .map(|(k, _)| k)
            .collect())
    }

    async fn set_counts(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, usize)>, StorageError> {
        let members = self.set_members(collection, keys).await?;
        Ok(members.into_iter().map(|(k, m)| (k, m.len())).collect())
    }
}
