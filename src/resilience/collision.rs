// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Duplicate-key collision resolver.
//!
//! Two upserts racing on a key that does not exist yet can both decide to
//! insert; the backing store's uniqueness constraint lets one win and fails
//! the other with a duplicate-key error even though the caller asked for an
//! upsert. Re-running the losing operation finds the row and merges into it.
//!
//! Only [`StorageError::DuplicateKey`] is retried, and only once. Anything
//! else, including a second collision, goes back to the caller unchanged.

use std::future::Future;
use tracing::{info, warn};

use crate::metrics;
use crate::storage::traits::StorageError;

/// Retries allowed after the first attempt.
pub const MAX_COLLISION_RETRIES: usize = 1;

/// Run `operation`, re-running it from the top once if it fails with a
/// duplicate-key collision.
pub async fn resolve_collisions<F, Fut, T>(operation_name: &str, mut operation: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Err(err) if err.is_duplicate_key() => {
                if retries >= MAX_COLLISION_RETRIES {
                    warn!(operation = operation_name, error = %err, "Duplicate-key collision persisted after retry");
                    metrics::record_collision(operation_name, "exhausted");
                    return Err(err);
                }
                retries += 1;
                info!(operation = operation_name, error = %err, "Duplicate-key collision, retrying");
                metrics::record_collision(operation_name, "retried");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Operation failing once per scripted entry ("dup" is a collision,
    /// anything else a backend error), then succeeding.
    fn scripted(
        failures: Vec<&'static str>,
    ) -> (Arc<AtomicUsize>, impl FnMut() -> std::future::Ready<Result<u32, StorageError>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(match failures.get(n).copied() {
                Some("dup") => Err(StorageError::DuplicateKey {
                    collection: "objects".into(),
                    key: "user:1".into(),
                }),
                Some(other) => Err(StorageError::Backend(other.to_string())),
                None => Ok(7),
            })
        };
        (calls, op)
    }

    #[tokio::test]
    async fn test_success_runs_once() {
        let (calls, op) = scripted(vec![]);
        assert_eq!(resolve_collisions("set_object", op).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_collision_is_retried() {
        let (calls, op) = scripted(vec!["dup"]);
        assert_eq!(resolve_collisions("set_object", op).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_collision_propagates() {
        let (calls, op) = scripted(vec!["dup", "dup"]);
        let err = resolve_collisions("set_object", op).await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let (calls, op) = scripted(vec!["connection reset"]);
        let err = resolve_collisions("set_object", op).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
