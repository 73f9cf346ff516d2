use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::events::{EventKind, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Event handlers keyed by subscription. Lives as long as the channel, not the
/// socket, so registrations carry over when the socket is replaced.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<SubscriptionId, (EventKind, EventHandler)>>,
    by_kind: Arc<DashMap<EventKind, DashSet<SubscriptionId>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.handlers.insert(id, (kind, handler));
        self.by_kind.entry(kind).or_default().insert(id);
        debug!(subscription = %id, event = kind.name(), "handler subscribed");
        id
    }

    /// Removes a handler. Unknown or already removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, (kind, _))) = self.handlers.remove(&id) else {
            return false;
        };

        if let Some(ids) = self.by_kind.get(&kind) {
            ids.remove(&id);
            if ids.is_empty() {
                drop(ids);
                self.by_kind.remove_if(&kind, |_, v| v.is_empty());
            }
        }

        debug!(subscription = %id, event = kind.name(), "handler unsubscribed");
        true
    }

    /// Calls every handler registered for the event's kind. Returns how many ran.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let ids: Vec<SubscriptionId> = match self.by_kind.get(&kind) {
            Some(ids) => ids.iter().map(|r| *r).collect(),
            None => return 0,
        };

        // Collect first so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<EventHandler> = ids
            .iter()
            .filter_map(|id| self.handlers.get(id).map(|entry| entry.value().1.clone()))
            .collect();

        for handler in &handlers {
            handler(event);
        }

        trace!(event = kind.name(), handlers = handlers.len(), "dispatched");
        handlers.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.by_kind.get(&kind).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
