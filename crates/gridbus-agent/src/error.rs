//! Agent-side error types.

use gridbus_wire::message::MessageError;
use gridbus_wire::transport::TransportError;
use thiserror::Error;

/// Errors from the agent-side connection and pub/sub client.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The router did not acknowledge `hello` within the timeout. Fatal:
    /// the agent stops instead of silently retrying half-connected.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The router answered the handshake with something other than `welcome`.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport shut down while a reply was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// A transport-level send failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An inbound frame set failed validation.
    #[error(transparent)]
    Frame(#[from] MessageError),

    /// A payload failed to serialize.
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Alias for agent results.
pub type AgentResult<T> = Result<T, AgentError>;
