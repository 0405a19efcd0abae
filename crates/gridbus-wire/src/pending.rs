//! Reply correlation for request/response exchanges.
//!
//! Any call expecting a reply registers its message id here and suspends on
//! the returned handle; the receive loop fulfills it when a reply frame with
//! the matching id arrives. Results are set-once: an abandoned handle is
//! simply never resolved, and stale registrations are reclaimed by explicit
//! expiry rather than collector timing.

use crate::message::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

struct PendingEntry {
    tx: oneshot::Sender<Message>,
    registered_at: Instant,
}

/// Map from message id to a single-fulfillment reply handle.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<DashMap<String, PendingEntry>>,
}

/// The waiting side of a registered request.
pub struct PendingReply {
    rx: oneshot::Receiver<Message>,
}

impl PendingReply {
    /// Wait for the reply. `None` if the registration was expired or the
    /// requesting side was dropped without fulfillment.
    pub async fn recv(self) -> Option<Message> {
        self.rx.await.ok()
    }
}

impl PendingRequests {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message id and return the handle its reply will resolve.
    ///
    /// Re-registering an id replaces the previous entry; the superseded
    /// handle resolves to `None`.
    pub fn register(&self, id: impl Into<String>) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(
            id.into(),
            PendingEntry {
                tx,
                registered_at: Instant::now(),
            },
        );
        PendingReply { rx }
    }

    /// Resolve the handle registered under `message.id`, if any.
    ///
    /// Returns whether a registration existed. Delivery to a handle whose
    /// waiter has gone away is silently dropped.
    pub fn fulfill(&self, message: Message) -> bool {
        match self.inner.remove(&message.id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(message);
                true
            }
            None => false,
        }
    }

    /// Drop every registration older than `ttl`. Expired handles resolve to
    /// `None`. Returns the number of entries removed.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let before = self.inner.len();
        self.inner
            .retain(|_, entry| entry.registered_at.elapsed() < ttl);
        before.saturating_sub(self.inner.len())
    }

    /// Number of outstanding registrations.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no registration is outstanding.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
