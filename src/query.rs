use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::cache::{CacheStore, CommitOutcome};
use crate::error::ApiError;
use crate::types::QueryKey;

/// Serves `key` from cache when fresh, otherwise fetches and caches it.
pub async fn resolve_query<T, F, Fut>(cache: &CacheStore, key: &QueryKey, fetch: F) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    if cache.is_fresh(key) {
        if let Some(value) = cache.read_as::<T>(key)? {
            debug!(%key, "serving from cache");
            return Ok(value);
        }
    }

    fetch_and_cache(cache, key, fetch).await
}

/// Always fetches. A response overtaken by a newer one for the same key is
/// discarded and the newer cached value returned instead.
pub async fn fetch_and_cache<T, F, Fut>(cache: &CacheStore, key: &QueryKey, fetch: F) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let generation = cache.begin_generation(key);
    let value = fetch().await?;
    let json = serde_json::to_value(&value)?;

    match cache.commit(key, generation, json) {
        CommitOutcome::Committed => Ok(value),
        CommitOutcome::Superseded => match cache.read_as::<T>(key)? {
            Some(newer) => Ok(newer),
            None => Ok(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::cache::KeySelector;

    #[tokio::test]
    async fn fresh_entry_skips_fetch() {
        let cache = CacheStore::default();
        let key = QueryKey::new("posts");
        cache.write(key.clone(), json!(["cached"]));
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        let value: Vec<String> = resolve_query(&cache, &key, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["fetched".to_string()])
        })
        .await
        .unwrap();

        assert_eq!(value, vec!["cached"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entry_is_refetched() {
        let cache = CacheStore::default();
        let key = QueryKey::new("posts");
        cache.write(key.clone(), json!(["cached"]));
        cache.invalidate(&KeySelector::Exact(key.clone()));

        let value: Vec<String> = resolve_query(&cache, &key, || async { Ok(vec!["fetched".into()]) })
            .await
            .unwrap();

        assert_eq!(value, vec!["fetched"]);
        assert!(cache.is_fresh(&key));
    }

    #[tokio::test]
    async fn fetch_error_leaves_cache_untouched() {
        let cache = CacheStore::default();
        let key = QueryKey::new("posts");
        cache.write(key.clone(), json!(["cached"]));
        let before = cache.read(&key);

        let result: Result<Vec<String>, _> =
            fetch_and_cache(&cache, &key, || async { Err(ApiError::NotAuthenticated) }).await;

        assert!(result.is_err());
        assert_eq!(cache.read(&key), before);
    }

    #[tokio::test]
    async fn late_response_does_not_overwrite_newer_one() {
        let cache = CacheStore::default();
        let key = QueryKey::new("posts");
        let (release_old, old_gate) = oneshot::channel::<()>();

        let slow = fetch_and_cache(&cache, &key, move || async move {
            let _ = old_gate.await;
            Ok("old".to_string())
        });
        let fast = async {
            tokio::task::yield_now().await;
            let value = fetch_and_cache(&cache, &key, || async { Ok("new".to_string()) }).await;
            let _ = release_old.send(());
            value
        };

        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(fast.unwrap(), "new");
        assert_eq!(slow.unwrap(), "new");
        assert_eq!(cache.read(&key).unwrap().value, json!("new"));
    }
}
