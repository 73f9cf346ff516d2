use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::generation::{ApplyDecision, GenerationGuard};
use crate::types::{CacheEntry, QueryKey};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    Exact(QueryKey),
    Resource(Arc<str>),
}

impl KeySelector {
    pub fn resource(name: &str) -> Self {
        Self::Resource(Arc::from(name))
    }
}

impl From<QueryKey> for KeySelector {
    fn from(key: QueryKey) -> Self {
        Self::Exact(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Written(QueryKey),
    Invalidated(QueryKey),
    Removed(QueryKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Superseded,
}

/// In-memory projection of server state, keyed by query identity.
///
/// Subscribers get a `CacheEvent` for every write, invalidation and removal.
#[derive(Clone)]
pub struct CacheStore {
    entries: Arc<DashMap<QueryKey, CacheEntry>>,
    resource_index: Arc<DashMap<Arc<str>, DashSet<QueryKey>>>,
    generations: Arc<DashMap<QueryKey, Arc<GenerationGuard>>>,
    events: broadcast::Sender<CacheEvent>,
    stale_after: Duration,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl CacheStore {
    pub fn new(stale_after: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: Arc::new(DashMap::new()),
            resource_index: Arc::new(DashMap::new()),
            generations: Arc::new(DashMap::new()),
            events,
            stale_after,
        }
    }

    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn read_as<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>, serde_json::Error> {
        self.read(key)
            .map(|entry| serde_json::from_value(entry.value))
            .transpose()
    }

    pub fn write(&self, key: QueryKey, value: Value) {
        self.entries.insert(key.clone(), CacheEntry::fresh(value));
        self.index(&key);
        trace!(%key, "cache write");
        self.notify(CacheEvent::Written(key));
    }

    pub fn write_as<T: Serialize + ?Sized>(&self, key: QueryKey, value: &T) -> Result<(), serde_json::Error> {
        self.write(key, serde_json::to_value(value)?);
        Ok(())
    }

    /// Puts back an exact snapshot taken with `read`, including absence.
    pub fn restore(&self, key: &QueryKey, snapshot: Option<CacheEntry>) {
        match snapshot {
            Some(entry) => {
                self.entries.insert(key.clone(), entry);
                self.index(key);
                self.notify(CacheEvent::Written(key.clone()));
            }
            None => {
                if self.entries.remove(key).is_some() {
                    self.unindex(key);
                    self.notify(CacheEvent::Removed(key.clone()));
                }
                self.prune_generation(key);
            }
        }
    }

    /// A fresh entry is present, not invalidated and younger than the stale window.
    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        if entry.stale {
            return false;
        }
        let age = Utc::now().signed_duration_since(entry.updated_at);
        age.to_std().map(|age| age < self.stale_after).unwrap_or(true)
    }

    /// Marks matching entries stale so the next read refetches them.
    pub fn invalidate(&self, selector: &KeySelector) -> Vec<QueryKey> {
        let keys = self.matching_keys(selector);
        let mut stale_keys = Vec::with_capacity(keys.len());

        for key in keys {
            let marked = match self.entries.get_mut(&key) {
                Some(mut entry) => {
                    entry.stale = true;
                    true
                }
                None => false,
            };
            if !marked {
                continue;
            }
            self.notify(CacheEvent::Invalidated(key.clone()));
            stale_keys.push(key);
        }

        debug!(count = stale_keys.len(), "invalidated cache entries");
        stale_keys
    }

    pub fn remove(&self, selector: &KeySelector) -> Vec<QueryKey> {
        let keys = self.matching_keys(selector);
        let mut removed = Vec::with_capacity(keys.len());

        for key in keys {
            if self.entries.remove(&key).is_some() {
                self.unindex(&key);
                self.prune_generation(&key);
                self.notify(CacheEvent::Removed(key.clone()));
                removed.push(key);
            }
        }

        removed
    }

    /// Starts a fetch for `key` and returns its generation.
    pub fn begin_generation(&self, key: &QueryKey) -> u64 {
        self.generation_guard(key).issue()
    }

    /// Writes a query response unless a later generation already committed.
    pub fn commit(&self, key: &QueryKey, generation: u64, value: Value) -> CommitOutcome {
        let guard = self.generation_guard(key);

        // The entry lock is held across classify + insert so two responses
        // for the same key cannot interleave.
        let decision = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let decision = guard.classify(generation);
                if decision == ApplyDecision::Apply {
                    occupied.insert(CacheEntry::fresh(value));
                }
                decision
            }
            Entry::Vacant(vacant) => {
                let decision = guard.classify(generation);
                if decision == ApplyDecision::Apply {
                    vacant.insert(CacheEntry::fresh(value));
                }
                decision
            }
        };

        match decision {
            ApplyDecision::Apply => {
                self.index(key);
                self.notify(CacheEvent::Written(key.clone()));
                CommitOutcome::Committed
            }
            ApplyDecision::DropSuperseded { committed } => {
                debug!(%key, generation, committed, "dropping superseded response");
                CommitOutcome::Superseded
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Change feed for collaborators. Lagged receivers skip what they missed.
    pub fn events(&self) -> impl Stream<Item = CacheEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move { event.ok() })
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    fn matching_keys(&self, selector: &KeySelector) -> Vec<QueryKey> {
        match selector {
            KeySelector::Exact(key) => vec![key.clone()],
            KeySelector::Resource(resource) => match self.resource_index.get(resource) {
                Some(keys) => keys.iter().map(|k| k.key().clone()).collect(),
                None => Vec::new(),
            },
        }
    }

    fn generation_guard(&self, key: &QueryKey) -> Arc<GenerationGuard> {
        self.generations
            .entry(key.clone())
            .or_default()
            .value()
            .clone()
    }

    // A guard with a fetch still outstanding must survive, or its late
    // response would be judged against a fresh counter.
    fn prune_generation(&self, key: &QueryKey) {
        self.generations
            .remove_if(key, |_, guard| guard.latest_issued() == guard.committed());
    }

    fn index(&self, key: &QueryKey) {
        self.resource_index
            .entry(key.resource.clone())
            .or_default()
            .insert(key.clone());
    }

    fn unindex(&self, key: &QueryKey) {
        if let Some(set) = self.resource_index.get(&key.resource) {
            set.remove(key);
            if set.is_empty() {
                drop(set);
                self.resource_index
                    .remove_if(&key.resource, |_, v| v.is_empty());
            }
        }
    }

    fn notify(&self, event: CacheEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(resource: &str, params: Value) -> QueryKey {
        QueryKey::with_params(resource, &params).unwrap()
    }

    #[test]
    fn write_then_read() {
        let cache = CacheStore::default();
        let posts = QueryKey::new("posts");
        cache.write(posts.clone(), json!([1, 2]));

        let entry = cache.read(&posts).unwrap();
        assert_eq!(entry.value, json!([1, 2]));
        assert!(!entry.stale);
        assert!(cache.is_fresh(&posts));
        assert_eq!(cache.read_as::<Vec<u32>>(&posts).unwrap(), Some(vec![1, 2]));
    }

    #[test]
    fn invalidate_by_resource_marks_every_variant() {
        let cache = CacheStore::default();
        let by_post = key("comments", json!({"postId": "p1"}));
        let by_comment = key("comments", json!({"commentId": "c1"}));
        let posts = QueryKey::new("posts");
        cache.write(by_post.clone(), json!([]));
        cache.write(by_comment.clone(), json!([]));
        cache.write(posts.clone(), json!([]));

        let stale = cache.invalidate(&KeySelector::resource("comments"));

        assert_eq!(stale.len(), 2);
        assert!(!cache.is_fresh(&by_post));
        assert!(!cache.is_fresh(&by_comment));
        assert!(cache.is_fresh(&posts));
        // Stale data stays readable until the refetch lands.
        assert_eq!(cache.read(&by_post).unwrap().value, json!([]));
    }

    #[test]
    fn entries_older_than_window_are_stale() {
        let cache = CacheStore::new(Duration::ZERO);
        let posts = QueryKey::new("posts");
        cache.write(posts.clone(), json!([]));
        assert!(!cache.is_fresh(&posts));
    }

    #[test]
    fn remove_by_resource_clears_index() {
        let cache = CacheStore::default();
        let user = key("auth", json!("user"));
        cache.write(user.clone(), json!({"id": "u1"}));

        assert_eq!(cache.remove(&KeySelector::resource("auth")), vec![user.clone()]);
        assert!(cache.read(&user).is_none());
        assert!(cache.remove(&KeySelector::resource("auth")).is_empty());
    }

    #[test]
    fn restore_puts_back_exact_snapshot() {
        let cache = CacheStore::default();
        let posts = QueryKey::new("posts");
        cache.write(posts.clone(), json!(["original"]));
        let snapshot = cache.read(&posts);

        cache.write(posts.clone(), json!(["speculative"]));
        cache.restore(&posts, snapshot.clone());
        assert_eq!(cache.read(&posts), snapshot);

        let absent = QueryKey::new("users");
        cache.write(absent.clone(), json!([]));
        cache.restore(&absent, None);
        assert!(cache.read(&absent).is_none());
    }

    #[test]
    fn superseded_generation_does_not_overwrite() {
        let cache = CacheStore::default();
        let posts = QueryKey::new("posts");

        let older = cache.begin_generation(&posts);
        let newer = cache.begin_generation(&posts);

        assert_eq!(cache.commit(&posts, newer, json!("newer")), CommitOutcome::Committed);
        assert_eq!(cache.commit(&posts, older, json!("older")), CommitOutcome::Superseded);
        assert_eq!(cache.read(&posts).unwrap().value, json!("newer"));
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let cache = CacheStore::default();
        let mut events = cache.subscribe();
        let posts = QueryKey::new("posts");

        cache.write(posts.clone(), json!([]));
        cache.invalidate(&KeySelector::Exact(posts.clone()));
        cache.remove(&KeySelector::Exact(posts.clone()));

        assert_eq!(events.recv().await.unwrap(), CacheEvent::Written(posts.clone()));
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Invalidated(posts.clone()));
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Removed(posts));
    }

    #[tokio::test]
    async fn event_stream_follows_entry_lifecycle() {
        let cache = CacheStore::default();
        let feed = cache.events();
        tokio::pin!(feed);
        let user = key("auth", json!("user"));

        cache.write(user.clone(), json!({"id": "u1"}));
        cache.invalidate(&KeySelector::resource("auth"));
        cache.remove(&KeySelector::resource("auth"));

        assert_eq!(feed.next().await, Some(CacheEvent::Written(user.clone())));
        assert_eq!(feed.next().await, Some(CacheEvent::Invalidated(user.clone())));
        assert_eq!(feed.next().await, Some(CacheEvent::Removed(user)));
    }

    #[test]
    fn removing_settled_key_forgets_its_generation() {
        let cache = CacheStore::default();
        let posts = QueryKey::new("posts");
        let users = QueryKey::new("users");

        for key in [&posts, &users] {
            let generation = cache.begin_generation(key);
            cache.commit(key, generation, json!([]));
        }
        cache.remove(&KeySelector::Exact(posts.clone()));
        cache.restore(&users, None);

        assert!(!cache.generations.contains_key(&posts));
        assert!(!cache.generations.contains_key(&users));
    }

    #[test]
    fn outstanding_fetch_keeps_generation_after_remove() {
        let cache = CacheStore::default();
        let posts = QueryKey::new("posts");

        let first = cache.begin_generation(&posts);
        cache.commit(&posts, first, json!(["first"]));
        let late = cache.begin_generation(&posts);
        cache.remove(&KeySelector::Exact(posts.clone()));

        assert!(cache.generations.contains_key(&posts));
        assert_eq!(cache.commit(&posts, late, json!(["late"])), CommitOutcome::Committed);
        assert_eq!(cache.commit(&posts, first, json!(["first"])), CommitOutcome::Superseded);
    }
}
