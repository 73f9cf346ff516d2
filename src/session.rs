use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Expired { reason: String },
}

/// Process-wide "session expired" broadcast.
///
/// The signal is armed while a session is live and disarms itself on the
/// first expiry, so a burst of failed requests yields one event.
pub struct SessionSignal {
    armed: AtomicBool,
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionSignal {
    pub fn new(armed: bool) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            armed: AtomicBool::new(armed),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Called whenever a fresh credential is obtained (login, refresh).
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Raises the expiry event if this session has not expired yet.
    /// Returns whether an event was sent.
    pub fn expire(&self, reason: impl Into<String>) -> bool {
        if !self.armed.swap(false, Ordering::SeqCst) {
            debug!("session already expired, suppressing duplicate signal");
            return false;
        }

        let reason = reason.into();
        warn!(%reason, "session expired");
        // No subscribers is fine.
        let _ = self.tx.send(SessionEvent::Expired { reason });
        true
    }
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new(false)
    }
}
