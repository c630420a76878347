// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Set storage: deduplicated, unordered string members per key.
//!
//! Sets are read straight from the backend on every call; the cache layer
//! is only used to invalidate the key on writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::cache::CacheLayer;
use crate::metrics;
use crate::resilience::collision::resolve_collisions;
use crate::storage::traits::{distinct_keys, Backend, StorageError};

const STORE: &str = "sets";

fn to_members<M: AsRef<str>>(members: &[M]) -> Vec<String> {
    members.iter().map(|m| m.as_ref().to_string()).collect()
}

/// Handle onto the Sets of one collection.
#[derive(Clone)]
pub struct SetStore {
    backend: Arc<dyn Backend>,
    cache: CacheLayer,
    collection: Arc<str>,
}

impl SetStore {
    pub fn new(backend: Arc<dyn Backend>, cache: CacheLayer, collection: &str) -> Self {
        Self {
            backend,
            cache,
            collection: Arc::from(collection),
        }
    }

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

    pub async fn set_add<M: AsRef<str>>(&self, key: &str, members: &[M]) -> Result<(), StorageError> {
        self.sets_add(&[key], members).await
    }

    /// Add the same `members` to every Set in `keys`, creating absent Sets.
    pub async fn sets_add<S: AsRef<str>, M: AsRef<str>>(&self, keys: &[S], members: &[M]) -> Result<(), StorageError> {
        let keys = distinct_keys(keys);
        let members = to_members(members);
        if keys.is_empty() || members.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "set_add");

        let result = resolve_collisions("set_add", || self.backend.set_add(&self.collection, &keys, &members)).await;
        self.cache.del(&self.collection, &keys);
        metrics::observe(STORE, "set_add", result)
    }

    pub async fn set_remove<M: AsRef<str>>(&self, key: &str, members: &[M]) -> Result<(), StorageError> {
        self.sets_remove_members(&[key], members).await
    }

    /// Remove one `member` from every Set in `keys`.
    pub async fn sets_remove<S: AsRef<str>>(&self, keys: &[S], member: &str) -> Result<(), StorageError> {
        self.sets_remove_members(keys, &[member]).await
    }

    /// Remove every occurrence of `members` from every Set in `keys`.
    /// Members that are not present are ignored.
    pub async fn sets_remove_members<S: AsRef<str>, M: AsRef<str>>(
        &self,
        keys: &[S],
        members: &[M],
    ) -> Result<(), StorageError> {
        let keys = distinct_keys(keys);
        let members = to_members(members);
        if keys.is_empty() || members.is_empty() {
            return Ok(());
        }
        let _timer = crate::time_operation!(STORE, "set_remove");

        let result = self.backend.set_remove(&self.collection, &keys, &members).await;
        self.cache.del(&self.collection, &keys);
        metrics::observe(STORE, "set_remove", result)
    }

    pub async fn is_set_member(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        Ok(self.is_set_members(key, &[member]).await?.first().copied().unwrap_or(false))
    }

    /// Membership of each of `members`, from a single fetch of the Set.
    pub async fn is_set_members<M: AsRef<str>>(&self, key: &str, members: &[M]) -> Result<Vec<bool>, StorageError> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let current: HashSet<String> = self.get_set_members(key).await?.into_iter().collect();
        Ok(members.iter().map(|m| current.contains(m.as_ref())).collect())
    }

    /// Whether each Set in `keys` holds `member`, in one query.
    pub async fn is_member_of_sets<S: AsRef<str>>(&self, keys: &[S], member: &str) -> Result<Vec<bool>, StorageError> {
        let distinct = distinct_keys(keys);
        if distinct.is_empty() {
            return Ok(vec![false; keys.len()]);
        }
        let containing: HashSet<String> = self
            .backend
            .sets_containing(&self.collection, &distinct, member)
            .await?
            .into_iter()
            .collect();
        Ok(keys.iter().map(|k| containing.contains(k.as_ref())).collect())
    }

    /// Members of the Set, empty if it does not exist.
    pub async fn get_set_members(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.get_sets_members(&[key]).await?.pop().unwrap_or_default())
    }

    pub async fn get_sets_members<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<Vec<String>>, StorageError> {
        let distinct = distinct_keys(keys);
        if distinct.is_empty() {
            return Ok(vec![Vec::new(); keys.len()]);
        }
        let _timer = crate::time_operation!(STORE, "get_sets_members");
        let result = self.backend.set_members(&self.collection, &distinct).await;
        let found: HashMap<String, Vec<String>> = metrics::observe(STORE, "get_sets_members", result)?
            .into_iter()
            .collect();
        Ok(keys
            .iter()
            .map(|k| found.get(k.as_ref()).cloned().unwrap_or_default())
            .collect())
    }

    pub async fn set_count(&self, key: &str) -> Result<usize, StorageError> {
        Ok(self.sets_count(&[key]).await?.first().copied().unwrap_or(0))
    }

    /// Cardinality per key from one aggregation query; 0 for absent Sets.
    pub async fn sets_count<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<usize>, StorageError> {
        let distinct = distinct_keys(keys);
        if distinct.is_empty() {
            return Ok(vec![0; keys.len()]);
        }
        let counts: HashMap<String, usize> = self
            .backend
            .set_counts(&self.collection, &distinct)
            .await?
            .into_iter()
            .collect();
        Ok(keys.iter().map(|k| counts.get(k.as_ref()).copied().unwrap_or(0)).collect())
    }

    /// Remove and return a uniformly chosen member, `None` if the Set is
    /// absent or empty. The draw and the removal happen in one backend step,
    /// so concurrent callers never receive the same member.
    pub async fn set_remove_random(&self, key: &str) -> Result<Option<String>, StorageError> {
        if key.is_empty() {
            return Ok(None);
        }
        let _timer = crate::time_operation!(STORE, "set_pop");

        let result = self.backend.set_pop(&self.collection, key).await;
        self.cache.del(&self.collection, &[key.to_string()]);
        let member = metrics::observe(STORE, "set_pop", result)?;
        if let Some(member) = &member {
            debug!(collection = %self.collection, key, member = %member, "Removed random set member");
        }
        Ok(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::object_store::ObjectStore;
    use crate::storage::memory::MemoryBackend;
    use serde_json::json;

    fn setup() -> SetStore {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheLayer::new(Arc::new(MemoryCache::new(100)), "objects", None);
        SetStore::new(backend, cache, "objects")
    }

    fn sorted(mut members: Vec<String>) -> Vec<String> {
        members.sort();
        members
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let sets = setup();
        sets.set_add("tags:1", &["a", "b", "a"]).await.unwrap();
        let members = sets.get_set_members("tags:1").await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(sorted(members), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let sets = setup();
        sets.set_add("k", &["x"]).await.unwrap();
        sets.set_add("k", &["x"]).await.unwrap();
        assert_eq!(sets.set_count("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_membership_after_add_and_remove() {
        let sets = setup();
        sets.set_add("k", &["m"]).await.unwrap();
        assert!(sets.is_set_member("k", "m").await.unwrap());

        sets.set_remove("k", &["m"]).await.unwrap();
        assert!(!sets.is_set_member("k", "m").await.unwrap());
        assert_eq!(sets.set_count("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_absent_sets() {
        let sets = setup();
        assert!(sets.get_set_members("nope").await.unwrap().is_empty());
        assert_eq!(sets.set_count("nope").await.unwrap(), 0);
        assert_eq!(sets.set_remove_random("nope").await.unwrap(), None);
        sets.set_remove("nope", &["x"]).await.unwrap();
        assert!(sets.get_set_members("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_inputs_are_noops() {
        let sets = setup();
        let none: [&str; 0] = [];
        sets.set_add("k", &none).await.unwrap();
        sets.sets_add(&none, &["a"]).await.unwrap();
        assert_eq!(sets.set_count("k").await.unwrap(), 0);
        assert!(sets.is_set_members("k", &none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multi_key_forms_are_aligned() {
        let sets = setup();
        sets.sets_add(&["s1", "s2"], &["shared"]).await.unwrap();
        sets.set_add("s1", &["only1"]).await.unwrap();

        assert_eq!(
            sets.is_member_of_sets(&["s1", "s3", "s2", "s1"], "shared").await.unwrap(),
            vec![true, false, true, true]
        );
        assert_eq!(sets.sets_count(&["s2", "s1", "s3"]).await.unwrap(), vec![1, 2, 0]);

        let all = sets.get_sets_members(&["s3", "s1"]).await.unwrap();
        assert!(all[0].is_empty());
        assert_eq!(sorted(all[1].clone()), vec!["only1", "shared"]);

        assert_eq!(
            sets.is_set_members("s1", &["only1", "zzz", "shared"]).await.unwrap(),
            vec![true, false, true]
        );
    }

    #[tokio::test]
    async fn test_sets_remove_forms() {
        let sets = setup();
        sets.sets_add(&["s1", "s2"], &["a", "b", "c"]).await.unwrap();
        sets.sets_remove(&["s1", "s2"], "a").await.unwrap();
        sets.sets_remove_members(&["s2"], &["b", "missing"]).await.unwrap();

        assert_eq!(sorted(sets.get_set_members("s1").await.unwrap()), vec!["b", "c"]);
        assert_eq!(sets.get_set_members("s2").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_remove_random_drains_set() {
        let sets = setup();
        sets.set_add("k", &["a", "b", "c"]).await.unwrap();

        let mut drawn = Vec::new();
        while let Some(member) = sets.set_remove_random("k").await.unwrap() {
            assert!(!sets.is_set_member("k", &member).await.unwrap());
            drawn.push(member);
        }
        assert_eq!(sorted(drawn), vec!["a", "b", "c"]);
        assert_eq!(sets.set_count("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_remove_random_hands_out_each_member_once() {
        let sets = setup();
        let members: Vec<String> = (0..40).map(|i| format!("m{}", i)).collect();
        sets.set_add("pool", members.as_slice()).await.unwrap();

        let mut handles = vec![];
        for _ in 0..8 {
            let sets = sets.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = vec![];
                while let Some(member) = sets.set_remove_random("pool").await.unwrap() {
                    mine.push(member);
                }
                mine
            }));
        }

        let mut drawn = vec![];
        for handle in handles {
            drawn.extend(handle.await.unwrap());
        }
        assert_eq!(drawn.len(), 40);
        assert_eq!(sorted(drawn), sorted(members));
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let sets = setup();
        let other = sets.with_collection("groups");
        sets.set_add("k", &["a"]).await.unwrap();
        other.set_add("k", &["b"]).await.unwrap();

        assert_eq!(sets.get_set_members("k").await.unwrap(), vec!["a"]);
        assert_eq!(other.get_set_members("k").await.unwrap(), vec!["b"]);
        assert_eq!(other.collection(), "groups");
    }

    #[tokio::test]
    async fn test_add_to_non_set_record_is_type_mismatch() {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheLayer::disabled("objects");
        let objects = ObjectStore::new(backend.clone(), cache.clone(), "objects");
        let sets = SetStore::new(backend, cache, "objects");

        objects.set_object_field("k", "members", json!(5)).await.unwrap();
        let err = sets.set_add("k", &["a"]).await.unwrap_err();
        assert!(matches!(err, StorageError::TypeMismatch { .. }));
    }
}
