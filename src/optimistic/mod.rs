//! Optimistic updates with rollback
//!
//! A mutation is applied locally before the authoritative request runs. If
//! the request fails, what the mutation changed is put back and the failure
//! is reported as [`ChatError::MutationFailure`]. Changes made by others while
//! the request was in flight survive the rollback.
//!
//! Locks are only held while snapshotting, mutating and restoring, never
//! across the request itself.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};

/// State that can be captured and later put back verbatim
pub trait Snapshot {
    type Snapshot: Clone + Send;

    fn snapshot(&self) -> Self::Snapshot;
    fn restore(&mut self, snapshot: Self::Snapshot);

    /// Undo a mutation after a failed request
    ///
    /// `before` and `after` bracket the mutation. Implementations whose
    /// state can change while the request is in flight should undo only the
    /// difference between the two and keep everything else.
    fn revert(&mut self, before: Self::Snapshot, after: Self::Snapshot) {
        let _ = after;
        self.restore(before);
    }
}

/// Apply `mutate` to `target`, then await `request`
///
/// On failure the mutation is reverted through [`Snapshot::revert`].
pub async fn with_rollback<T, R, M, Fut>(
    target: &Mutex<T>,
    label: &str,
    mutate: M,
    request: Fut,
) -> ChatResult<R>
where
    T: Snapshot,
    M: FnOnce(&mut T),
    Fut: Future<Output = ChatResult<R>>,
{
    let (before, after) = {
        let mut guard = target.lock();
        let before = guard.snapshot();
        mutate(&mut *guard);
        (before, guard.snapshot())
    };

    match request.await {
        Ok(value) => {
            debug!(label, "optimistic update confirmed");
            Ok(value)
        }
        Err(e) => {
            warn!(label, error = %e, "optimistic update failed, rolling back");
            target.lock().revert(before, after);
            Err(ChatError::MutationFailure {
                label: label.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

/// Keyed cache of server-backed values with optimistic writes
///
/// Used for generic flows such as approving a request or flipping a
/// booking status, where the UI shows the new value before the server
/// confirms it.
pub struct OptimisticCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for OptimisticCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> OptimisticCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        self.entries.lock().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Mutate the entry for `key` and await `request`
    ///
    /// The mutator sees `None` for absent keys and may insert, change or
    /// remove the value. A failed request puts the entry back exactly as it
    /// was, including back to absent.
    pub async fn with_optimistic_update<R, M, Fut>(
        &self,
        key: K,
        mutate: M,
        request: Fut,
    ) -> ChatResult<R>
    where
        M: FnOnce(&mut Option<V>),
        Fut: Future<Output = ChatResult<R>>,
    {
        let previous = {
            let mut entries = self.entries.lock();
            let previous = entries.get(&key).cloned();
            let mut slot = previous.clone();
            mutate(&mut slot);
            match slot {
                Some(value) => entries.insert(key.clone(), value),
                None => entries.remove(&key),
            };
            previous
        };

        match request.await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(?key, error = %e, "cached update failed, rolling back");
                let mut entries = self.entries.lock();
                match previous {
                    Some(value) => entries.insert(key.clone(), value),
                    None => entries.remove(&key),
                };
                Err(ChatError::MutationFailure {
                    label: format!("update of {:?}", key),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: u32,
        log: Vec<String>,
    }

    impl Snapshot for Counter {
        type Snapshot = Counter;

        fn snapshot(&self) -> Counter {
            self.clone()
        }

        fn restore(&mut self, snapshot: Counter) {
            *self = snapshot;
        }
    }

    fn counter() -> Mutex<Counter> {
        Mutex::new(Counter {
            value: 7,
            log: vec!["start".into()],
        })
    }

    #[tokio::test]
    async fn test_success_keeps_mutation() {
        let target = counter();
        let result = with_rollback(
            &target,
            "reset",
            |c| {
                c.value = 0;
                c.log.push("reset".into());
            },
            async { Ok::<_, ChatError>(42) },
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(target.lock().value, 0);
    }

    #[tokio::test]
    async fn test_failure_restores_exact_snapshot() {
        let target = counter();
        let before = target.lock().clone();

        let err = with_rollback(
            &target,
            "reset",
            |c| {
                c.value = 0;
                c.log.clear();
            },
            async { Err::<(), _>(ChatError::Api("offline".into())) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ChatError::MutationFailure { ref label, .. } if label == "reset"));
        assert!(err.to_string().contains("offline"));
        assert_eq!(*target.lock(), before);
    }

    #[tokio::test]
    async fn test_lock_is_free_during_request() {
        let target = counter();
        let result = with_rollback(&target, "bump", |c| c.value += 1, async {
            // Would deadlock if the guard were held across the await
            Ok::<_, ChatError>(target.lock().value)
        })
        .await
        .unwrap();
        assert_eq!(result, 8);
    }

    #[tokio::test]
    async fn test_cache_update_and_rollback() {
        let cache: OptimisticCache<String, &'static str> = OptimisticCache::new();
        cache.set("booking-1".into(), "pending");

        cache
            .with_optimistic_update(
                "booking-1".to_string(),
                |slot| *slot = Some("approved"),
                async { Ok::<_, ChatError>(()) },
            )
            .await
            .unwrap();
        assert_eq!(cache.get(&"booking-1".to_string()), Some("approved"));

        let err = cache
            .with_optimistic_update(
                "booking-1".to_string(),
                |slot| *slot = Some("rejected"),
                async { Err::<(), _>(ChatError::Api("500".into())) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::MutationFailure { .. }));
        assert_eq!(cache.get(&"booking-1".to_string()), Some("approved"));
    }

    #[tokio::test]
    async fn test_cache_absent_key_restores_to_absent() {
        let cache: OptimisticCache<String, u32> = OptimisticCache::new();
        let _ = cache
            .with_optimistic_update(
                "n1".to_string(),
                |slot| *slot = Some(1),
                async { Err::<(), _>(ChatError::Api("timeout".into())) },
            )
            .await;
        assert!(cache.get(&"n1".to_string()).is_none());
        assert!(cache.is_empty());
    }
}
