//! Transport seams between GBP and the underlying message bus.
//!
//! The router and agents are written against these traits; the concrete
//! socket bindings of the supported bus backends live outside this
//! workspace. The contract is an addressable, framed transport: a sink
//! routes a frame set to the peer named by its first segment, and a source
//! yields inbound frame sets in per-peer order.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors surfaced by a transport implementation.
///
/// `Unreachable` and `Again` are expected routing outcomes and are converted
/// into protocol error frames; anything `Fatal` propagates out of the event
/// loop and ends the process.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The addressed peer is not connected.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The peer exists but cannot accept the frame set right now.
    #[error("peer temporarily unavailable: {0}")]
    Again(String),

    /// An unexpected transport fault. Not convertible to a protocol error.
    #[error("transport failure: {0}")]
    Fatal(String),
}

impl TransportError {
    /// True for the host-unreachable outcome.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// True for the backpressure outcome.
    pub fn is_again(&self) -> bool {
        matches!(self, Self::Again(_))
    }
}

/// An inbound transport event.
#[derive(Debug)]
pub enum Inbound {
    /// A frame set from a connected peer.
    Frames(Vec<Bytes>),
    /// A peer's connection went away.
    Disconnected(String),
}

/// Sends frame sets to addressable peers.
///
/// The first segment names the destination; the transport consumes it and
/// delivers the remainder.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Route `frames` to the peer named by `frames[0]`.
    async fn send(&self, frames: Vec<Bytes>) -> Result<(), TransportError>;
}

/// Yields inbound transport events.
#[async_trait]
pub trait FrameSource: Send {
    /// The next inbound event, or `None` once the transport has shut down.
    async fn recv(&mut self) -> Option<Inbound>;
}
