//! Frame-level constants and helpers.
//!
//! A GBP frame set is an ordered sequence of opaque byte segments. The
//! routed layout, as seen by the router, is
//! `[SENDER, RECIPIENT, PROTO, USER_ID, MSG_ID, SUBSYSTEM, ...ARGS]`;
//! an empty `RECIPIENT` addresses the router itself. Once the router has
//! consumed the addressing pair, peers exchange the shorter
//! `[PEER, PROTO, USER_ID, MSG_ID, SUBSYSTEM, ...ARGS]` view modeled by
//! [`crate::message::Message`].

use bytes::Bytes;

/// Fixed protocol tag carried in every frame set.
pub const PROTOCOL_TAG: &str = "GBP1";

/// Protocol version announced in the `welcome` reply.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Subsystem tokens multiplexed over GBP frames.
pub mod subsystem {
    /// Connection handshake, answered by the router with `welcome`.
    pub const HELLO: &str = "hello";
    /// Router liveness check, answered with `pong`.
    pub const PING: &str = "ping";
    /// Reply to `ping`.
    pub const PONG: &str = "pong";
    /// Reply to `hello`.
    pub const WELCOME: &str = "welcome";
    /// Protocol error report.
    pub const ERROR: &str = "error";
    /// Publish/subscribe distribution.
    pub const PUBSUB: &str = "pubsub";
}

/// Segment positions within the routed frame layout.
pub mod routed {
    /// Originating peer identity.
    pub const SENDER: usize = 0;
    /// Destination peer identity; empty addresses the router.
    pub const RECIPIENT: usize = 1;
    /// Protocol tag position.
    pub const PROTO: usize = 2;
    /// Authenticated user id position.
    pub const USER_ID: usize = 3;
    /// Message id position.
    pub const MSG_ID: usize = 4;
    /// Subsystem token position.
    pub const SUBSYSTEM: usize = 5;
    /// Minimum routed frame count.
    pub const MIN_LEN: usize = 6;
}

/// Numeric protocol error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The addressed peer is not connected.
    PeerUnreachable,
    /// The addressed peer exists but cannot accept the frame right now.
    PeerTemporarilyUnavailable,
    /// The request was structurally or semantically malformed.
    BadRequest,
    /// The requester lacks a required capability.
    Unauthorized,
    /// The router or broker failed internally.
    Internal,
    /// The addressed subsystem is not implemented.
    NotImplemented,
}

impl ErrorCode {
    /// The wire representation of this code.
    pub fn code(self) -> u32 {
        match self {
            Self::PeerUnreachable => 30,
            Self::PeerTemporarilyUnavailable => 31,
            Self::BadRequest => 40,
            Self::Unauthorized => 41,
            Self::Internal => 50,
            Self::NotImplemented => 51,
        }
    }

    /// Parse a wire code back into an [`ErrorCode`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            30 => Some(Self::PeerUnreachable),
            31 => Some(Self::PeerTemporarilyUnavailable),
            40 => Some(Self::BadRequest),
            41 => Some(Self::Unauthorized),
            50 => Some(Self::Internal),
            51 => Some(Self::NotImplemented),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PeerUnreachable => "peer unreachable",
            Self::PeerTemporarilyUnavailable => "peer temporarily unavailable",
            Self::BadRequest => "bad request",
            Self::Unauthorized => "unauthorized",
            Self::Internal => "internal error",
            Self::NotImplemented => "not implemented",
        };
        write!(f, "{name}")
    }
}

/// Build a segment from a string.
pub fn seg(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

/// View a segment as text. Non-UTF-8 bytes are replaced, which is harmless
/// for header comparisons: a corrupted tag simply fails to match.
pub fn text(segment: &Bytes) -> String {
    String::from_utf8_lossy(segment).into_owned()
}
