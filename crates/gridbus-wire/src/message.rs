//! Structured message view and whole-set validation.
//!
//! [`Message`] is the peer-level view of a frame sequence:
//! `[PEER, PROTO, USER_ID, MSG_ID, SUBSYSTEM, ...ARGS]`. Decoding validates
//! the whole sequence up front; a frame set that fails validation is
//! rejected entire, never partially processed.

use crate::frame::{self, PROTOCOL_TAG};
use bytes::Bytes;
use thiserror::Error;

/// Why a frame set failed structural validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageErrorKind {
    /// Fewer than five segments.
    TooFewFrames,
    /// The protocol tag did not match [`PROTOCOL_TAG`].
    UnknownProtocol,
    /// The subsystem segment was empty after trimming.
    EmptySubsystem,
}

impl std::fmt::Display for MessageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::TooFewFrames => "too few frames",
            Self::UnknownProtocol => "unknown protocol tag",
            Self::EmptySubsystem => "empty subsystem",
        };
        write!(f, "{text}")
    }
}

/// A frame set that failed structural validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid message: {kind}")]
pub struct MessageError {
    /// The specific validation failure.
    pub kind: MessageErrorKind,
}

impl MessageError {
    /// Build an error of the given kind.
    pub fn new(kind: MessageErrorKind) -> Self {
        Self { kind }
    }
}

/// The structured view of a validated frame sequence.
///
/// Header segments are expected to be UTF-8; `args` remain opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Counterparty identity: the sender on receive, the recipient on send.
    pub peer: String,
    /// Protocol tag, always [`PROTOCOL_TAG`] after a successful decode.
    pub proto: String,
    /// Authenticated user id; empty for anonymous senders.
    pub user: String,
    /// Message id correlating requests with replies.
    pub id: String,
    /// Subsystem token selecting the sub-protocol.
    pub subsystem: String,
    /// Subsystem-specific argument segments.
    pub args: Vec<Bytes>,
}

impl Message {
    /// Build a message addressed to `peer`.
    pub fn new(
        peer: impl Into<String>,
        user: impl Into<String>,
        id: impl Into<String>,
        subsystem: impl Into<String>,
        args: Vec<Bytes>,
    ) -> Self {
        Self {
            peer: peer.into(),
            proto: PROTOCOL_TAG.to_string(),
            user: user.into(),
            id: id.into(),
            subsystem: subsystem.into(),
            args,
        }
    }

    /// Decode a frame sequence, validating the whole set.
    pub fn decode(frames: &[Bytes]) -> Result<Self, MessageError> {
        if frames.len() < 5 {
            return Err(MessageError::new(MessageErrorKind::TooFewFrames));
        }
        let proto = frame::text(&frames[1]);
        if proto != PROTOCOL_TAG {
            return Err(MessageError::new(MessageErrorKind::UnknownProtocol));
        }
        let subsystem = frame::text(&frames[4]);
        if subsystem.trim().is_empty() {
            return Err(MessageError::new(MessageErrorKind::EmptySubsystem));
        }
        Ok(Self {
            peer: frame::text(&frames[0]),
            proto,
            user: frame::text(&frames[2]),
            id: frame::text(&frames[3]),
            subsystem,
            args: frames[5..].to_vec(),
        })
    }

    /// Encode back into the frame sequence `decode` accepts. Exact inverse
    /// of [`Message::decode`] for every valid message.
    pub fn encode(&self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(5 + self.args.len());
        frames.push(frame::seg(&self.peer));
        frames.push(frame::seg(&self.proto));
        frames.push(frame::seg(&self.user));
        frames.push(frame::seg(&self.id));
        frames.push(frame::seg(&self.subsystem));
        frames.extend(self.args.iter().cloned());
        frames
    }
}
