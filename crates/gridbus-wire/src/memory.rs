//! In-process loopback transport.
//!
//! [`MemoryBus`] models the addressable bus with named mailboxes over real
//! tokio channels: agents send toward the router, which routes onward by the
//! first frame segment. Used by same-process agents and integration tests;
//! no sockets are involved.
//!
//! Backpressure is real: mailboxes are bounded, and a full mailbox surfaces
//! [`TransportError::Again`] to the caller instead of blocking.

use crate::frame::{self, seg};
use crate::transport::{FrameSink, FrameSource, Inbound, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Default bound of each mailbox.
const DEFAULT_CAPACITY: usize = 256;

struct BusInner {
    /// Peer mailboxes, keyed by identity.
    mailboxes: DashMap<String, mpsc::Sender<Inbound>>,
    /// The router's inbound queue, once attached.
    router: RwLock<Option<mpsc::Sender<Inbound>>>,
}

/// An in-process message bus shared by one router and its peers.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                mailboxes: DashMap::new(),
                router: RwLock::new(None),
            }),
        }
    }

    /// Attach the router endpoint. Frames sent by peers arrive on the
    /// returned source with the sender identity prepended.
    pub fn attach_router(&self) -> (RouterSink, MemorySource) {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        *self
            .inner
            .router
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);
        (
            RouterSink {
                inner: Arc::clone(&self.inner),
            },
            MemorySource { rx },
        )
    }

    /// Attach a peer endpoint under `identity` with the default mailbox bound.
    pub fn attach(&self, identity: &str) -> (PeerSink, MemorySource) {
        self.attach_with_capacity(identity, DEFAULT_CAPACITY)
    }

    /// Attach a peer endpoint with an explicit mailbox bound.
    pub fn attach_with_capacity(&self, identity: &str, capacity: usize) -> (PeerSink, MemorySource) {
        let (tx, rx) = mpsc::channel(capacity);
        self.inner.mailboxes.insert(identity.to_string(), tx);
        (
            PeerSink {
                identity: identity.to_string(),
                inner: Arc::clone(&self.inner),
            },
            MemorySource { rx },
        )
    }

    /// Drop a peer's mailbox and tell the router its connection went away.
    pub async fn disconnect(&self, identity: &str) {
        self.inner.mailboxes.remove(identity);
        debug!(peer = %identity, "endpoint detached");
        let router = self.router_tx();
        if let Some(tx) = router {
            let _ = tx.send(Inbound::Disconnected(identity.to_string())).await;
        }
    }

    fn router_tx(&self) -> Option<mpsc::Sender<Inbound>> {
        self.inner
            .router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Router-side sink: consumes the leading destination segment and delivers
/// the remainder to that peer's mailbox.
pub struct RouterSink {
    inner: Arc<BusInner>,
}

#[async_trait]
impl FrameSink for RouterSink {
    async fn send(&self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let destination = frames
            .first()
            .map(frame::text)
            .ok_or_else(|| TransportError::Fatal("empty frame set".to_string()))?;
        let mailbox = self
            .inner
            .mailboxes
            .get(&destination)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(destination.clone()))?;
        match mailbox.try_send(Inbound::Frames(frames[1..].to_vec())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Again(destination)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::Unreachable(destination))
            }
        }
    }
}

/// Peer-side sink: every send goes to the router with the sender identity
/// prepended, matching what an addressable socket would stamp.
pub struct PeerSink {
    identity: String,
    inner: Arc<BusInner>,
}

#[async_trait]
impl FrameSink for PeerSink {
    async fn send(&self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let router = self
            .inner
            .router
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TransportError::Unreachable("router".to_string()))?;
        let mut routed = Vec::with_capacity(frames.len() + 1);
        routed.push(seg(&self.identity));
        routed.extend(frames);
        match router.try_send(Inbound::Frames(routed)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::Again("router".to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::Unreachable("router".to_string()))
            }
        }
    }
}

/// Receiving half of a bus endpoint.
pub struct MemorySource {
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}
