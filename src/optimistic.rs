use std::{future::Future, sync::Arc};

use dashmap::DashSet;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheStore, KeySelector};
use crate::error::ApiError;
use crate::types::{CacheEntry, QueryKey};

/// What to do with the speculative value once the server accepts the mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSuccess {
    /// Keep the speculative value as the committed one.
    Commit,
    /// Mark the key stale so the next read fetches the authoritative value.
    Invalidate,
}

/// Applies a speculative delta to a cached value ahead of the network call
/// and restores the pre-mutation snapshot if the call fails.
#[derive(Clone)]
pub struct OptimisticMutator {
    cache: CacheStore,
    in_flight: Arc<DashSet<QueryKey>>,
}

impl OptimisticMutator {
    pub fn new(cache: CacheStore) -> Self {
        Self {
            cache,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Runs `network_call` with `delta` applied to the cached value at `key`.
    ///
    /// When nothing is cached under `key` there is nothing to speculate on
    /// and only the call runs. A second mutation on a key that already has one
    /// in flight is rejected.
    pub async fn mutate<T, R, D, F, Fut>(
        &self,
        key: &QueryKey,
        delta: D,
        network_call: F,
        on_success: OnSuccess,
    ) -> Result<R, ApiError>
    where
        T: Serialize + DeserializeOwned,
        D: FnOnce(T) -> T,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, ApiError>>,
    {
        if !self.in_flight.insert(key.clone()) {
            return Err(ApiError::MutationInFlight { key: key.clone() });
        }

        let snapshot = self.cache.read(key);
        let mut pending = PendingMutation {
            mutator: self,
            key,
            snapshot: Some(snapshot.clone()),
        };

        if let Some(entry) = snapshot {
            let current: T = serde_json::from_value(entry.value)?;
            self.cache.write_as(key.clone(), &delta(current))?;
            debug!(%key, "applied speculative update");
        }

        match network_call().await {
            Ok(result) => {
                pending.snapshot = None;
                if on_success == OnSuccess::Invalidate {
                    self.cache.invalidate(&KeySelector::Exact(key.clone()));
                }
                Ok(result)
            }
            Err(error) => {
                warn!(%key, %error, "mutation failed, rolling back");
                Err(error)
            }
        }
    }
}

/// Releases the key on drop and, unless disarmed, restores the snapshot.
/// Covers both an error from the call and the caller dropping the future.
struct PendingMutation<'a> {
    mutator: &'a OptimisticMutator,
    key: &'a QueryKey,
    snapshot: Option<Option<CacheEntry>>,
}

impl Drop for PendingMutation<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.mutator.cache.restore(self.key, snapshot);
        }
        self.mutator.in_flight.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::ErrorPayload;

    fn conflict() -> ApiError {
        ApiError::Conflict(ErrorPayload {
            status: 409,
            ..ErrorPayload::default()
        })
    }

    #[tokio::test]
    async fn failure_restores_exact_snapshot() {
        let cache = CacheStore::default();
        let mutator = OptimisticMutator::new(cache.clone());
        let key = QueryKey::new("counter");
        cache.write(key.clone(), json!(1));
        let before = cache.read(&key);

        let observed = cache.clone();
        let watched = key.clone();
        let result: Result<(), _> = mutator
            .mutate(
                &key,
                |n: u32| n + 1,
                move || async move {
                    // Speculative value is visible while the call is in flight.
                    assert_eq!(observed.read(&watched).unwrap().value, json!(2));
                    Err(conflict())
                },
                OnSuccess::Commit,
            )
            .await;

        assert!(matches!(result, Err(ApiError::Conflict(_))));
        assert_eq!(cache.read(&key), before);
        assert!(!mutator.is_in_flight(&key));
    }

    #[tokio::test]
    async fn success_commits_speculative_value() {
        let cache = CacheStore::default();
        let mutator = OptimisticMutator::new(cache.clone());
        let key = QueryKey::new("counter");
        cache.write(key.clone(), json!(1));

        let result = mutator
            .mutate(&key, |n: u32| n + 1, || async { Ok("done") }, OnSuccess::Commit)
            .await
            .unwrap();

        assert_eq!(result, "done");
        assert_eq!(cache.read(&key).unwrap().value, json!(2));
        assert!(cache.is_fresh(&key));
    }

    #[tokio::test]
    async fn success_can_invalidate_for_refetch() {
        let cache = CacheStore::default();
        let mutator = OptimisticMutator::new(cache.clone());
        let key = QueryKey::new("counter");
        cache.write(key.clone(), json!(1));

        mutator
            .mutate(&key, |n: u32| n + 1, || async { Ok(()) }, OnSuccess::Invalidate)
            .await
            .unwrap();

        let entry = cache.read(&key).unwrap();
        assert_eq!(entry.value, json!(2));
        assert!(entry.stale);
    }

    #[tokio::test]
    async fn absent_entry_stays_absent_on_failure() {
        let cache = CacheStore::default();
        let mutator = OptimisticMutator::new(cache.clone());
        let key = QueryKey::new("counter");

        let result: Result<(), _> = mutator
            .mutate(&key, |n: u32| n + 1, || async { Err(conflict()) }, OnSuccess::Commit)
            .await;

        assert!(result.is_err());
        assert!(cache.read(&key).is_none());
    }

    #[tokio::test]
    async fn second_mutation_on_busy_key_is_rejected() {
        let cache = CacheStore::default();
        let mutator = OptimisticMutator::new(cache.clone());
        let key = QueryKey::new("counter");
        cache.write(key.clone(), json!(1));
        let (release, gate) = oneshot::channel::<()>();

        let first = mutator.mutate(
            &key,
            |n: u32| n + 1,
            move || async move {
                let _ = gate.await;
                Ok(())
            },
            OnSuccess::Commit,
        );
        let second = async {
            tokio::task::yield_now().await;
            let outcome = mutator
                .mutate(&key, |n: u32| n + 10, || async { Ok(()) }, OnSuccess::Commit)
                .await;
            let _ = release.send(());
            outcome
        };

        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(ApiError::MutationInFlight { .. })));
        assert_eq!(cache.read(&key).unwrap().value, json!(2));
    }

    #[tokio::test]
    async fn dropped_mutation_rolls_back() {
        let cache = CacheStore::default();
        let mutator = OptimisticMutator::new(cache.clone());
        let key = QueryKey::new("counter");
        cache.write(key.clone(), json!(1));
        let before = cache.read(&key);

        let stalled = mutator.mutate(
            &key,
            |n: u32| n + 1,
            || futures::future::pending::<Result<(), ApiError>>(),
            OnSuccess::Commit,
        );
        let _ = tokio::time::timeout(std::time::Duration::from_millis(10), stalled).await;

        assert_eq!(cache.read(&key), before);
        assert!(!mutator.is_in_flight(&key));
    }
}
