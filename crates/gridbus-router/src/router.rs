//! The central message router.
//!
//! The router is stateless per request beyond the identity carried by the
//! transport: it validates each inbound frame set, answers router-local
//! requests (`hello`, `ping`, registered subsystems), and forwards everything
//! else to the addressed peer, converting expected transport failures into
//! protocol error frames. Unexpected transport faults are fatal and end the
//! loop, expecting a process restart.

use crate::federation::PlatformEvent;
use async_trait::async_trait;
use bytes::Bytes;
use gridbus_wire::frame::{
    routed, seg, subsystem, text, ErrorCode, PROTOCOL_TAG, PROTOCOL_VERSION,
};
use gridbus_wire::message::Message;
use gridbus_wire::transport::{FrameSink, FrameSource, Inbound, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Errors that end the router loop.
#[derive(Debug, Error)]
pub enum RouterError {
    /// An unexpected transport fault. Expected routing failures are turned
    /// into error frames and never reach this variant.
    #[error("fatal transport failure: {0}")]
    Transport(TransportError),

    /// A payload the router itself produced failed to serialize.
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Resolves the authenticated user behind a connection.
///
/// The credential store and verification scheme live outside the router;
/// it only consumes this mapping from `(sender, auth_token)` to a user id.
pub trait UserIdResolver: Send + Sync {
    /// The user id for `sender`'s presented token, or `None` when the token
    /// resolves to nobody.
    fn lookup(&self, sender: &str, auth_token: &str) -> Option<String>;
}

/// Resolver that knows no one: every sender is anonymous.
pub struct AnonymousResolver;

impl UserIdResolver for AnonymousResolver {
    fn lookup(&self, _sender: &str, _auth_token: &str) -> Option<String> {
        None
    }
}

/// What a registered subsystem did with a message.
#[derive(Debug)]
pub enum SubsystemOutcome {
    /// The subsystem does not implement this request.
    Unhandled,
    /// Handled, no reply needed.
    Handled,
    /// Handled; send these frames back.
    Reply(Vec<Bytes>),
}

/// A router-local subsystem beyond the built-in `hello`/`ping`.
#[async_trait]
pub trait Subsystem: Send + Sync {
    /// The subsystem token this handler answers to.
    fn name(&self) -> &str;

    /// Handle a message addressed to the router under this subsystem.
    async fn handle(&mut self, message: &Message) -> Result<SubsystemOutcome, RouterError>;

    /// A peer's connection went away.
    async fn peer_disconnected(&mut self, _peer: &str) -> Result<(), RouterError> {
        Ok(())
    }

    /// A remote platform instance connected or disconnected.
    async fn platform_event(&mut self, _event: &PlatformEvent) -> Result<(), RouterError> {
        Ok(())
    }
}

/// Build reply frames addressed to the requester, originated by the router.
pub fn local_reply(message: &Message, reply_subsystem: &str, args: Vec<Bytes>) -> Vec<Bytes> {
    let mut frames = vec![
        seg(&message.peer),
        seg(""),
        seg(PROTOCOL_TAG),
        seg(&message.user),
        seg(&message.id),
        seg(reply_subsystem),
    ];
    frames.extend(args);
    frames
}

/// Build an error frame:
/// `[peer, '', proto, user, id, 'error', code, message, recipient]`.
pub fn error_reply(
    peer: &str,
    user: &str,
    id: &str,
    code: ErrorCode,
    detail: &str,
    recipient: &str,
) -> Vec<Bytes> {
    vec![
        seg(peer),
        seg(""),
        seg(PROTOCOL_TAG),
        seg(user),
        seg(id),
        seg(subsystem::ERROR),
        seg(&code.code().to_string()),
        seg(detail),
        seg(recipient),
    ]
}

enum Step {
    Inbound(Option<Inbound>),
    Event(Option<PlatformEvent>),
}

async fn next_event(events: &mut Option<mpsc::Receiver<PlatformEvent>>) -> Option<PlatformEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The router event loop and its registered subsystems.
pub struct Router<S: FrameSource> {
    identity: String,
    source: S,
    sink: Arc<dyn FrameSink>,
    resolver: Arc<dyn UserIdResolver>,
    subsystems: Vec<Box<dyn Subsystem>>,
    events: Option<mpsc::Receiver<PlatformEvent>>,
}

impl<S: FrameSource> Router<S> {
    /// Create a router with no registered subsystems and an anonymous-only
    /// user resolver.
    pub fn new(identity: impl Into<String>, source: S, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            identity: identity.into(),
            source,
            sink,
            resolver: Arc::new(AnonymousResolver),
            subsystems: Vec::new(),
            events: None,
        }
    }

    /// Replace the user-id resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn UserIdResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Register a subsystem handler.
    pub fn register(mut self, handler: Box<dyn Subsystem>) -> Self {
        self.subsystems.push(handler);
        self
    }

    /// Feed platform connect/disconnect events into the loop.
    pub fn with_platform_events(mut self, events: mpsc::Receiver<PlatformEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run until the transport shuts down or a fatal fault occurs.
    ///
    /// All subscription state lives in subsystems owned by this loop, so a
    /// single task mutates it; cross-thread callers must marshal through the
    /// transport rather than touching subsystems directly.
    pub async fn run(&mut self) -> Result<(), RouterError> {
        info!(identity = %self.identity, "router loop started");
        loop {
            let step = {
                let source = &mut self.source;
                let events = &mut self.events;
                tokio::select! {
                    inbound = source.recv() => Step::Inbound(inbound),
                    event = next_event(events) => Step::Event(event),
                }
            };
            match step {
                Step::Inbound(Some(Inbound::Frames(frames))) => {
                    self.handle_frames(frames).await?;
                }
                Step::Inbound(Some(Inbound::Disconnected(peer))) => {
                    debug!(peer = %peer, "peer disconnected");
                    for handler in &mut self.subsystems {
                        handler.peer_disconnected(&peer).await?;
                    }
                }
                Step::Inbound(None) => {
                    info!(identity = %self.identity, "transport closed, router loop ending");
                    return Ok(());
                }
                Step::Event(Some(event)) => {
                    for handler in &mut self.subsystems {
                        handler.platform_event(&event).await?;
                    }
                }
                Step::Event(None) => {
                    self.events = None;
                }
            }
        }
    }

    async fn handle_frames(&mut self, mut frames: Vec<Bytes>) -> Result<(), RouterError> {
        if frames.len() == 2 && frames[1].is_empty() {
            debug!(peer = %text(&frames[0]), "probe frame dropped");
            return Ok(());
        }
        if frames.len() < routed::MIN_LEN {
            error!(segments = frames.len(), "frame set too short, dropped");
            return Ok(());
        }

        let sender = text(&frames[routed::SENDER]);
        let auth_token = text(&frames[routed::USER_ID]);
        let user = match self.resolver.lookup(&sender, &auth_token) {
            Some(user) => user,
            None => {
                debug!(peer = %sender, "no resolvable user id, treating as anonymous");
                String::new()
            }
        };
        frames[routed::USER_ID] = seg(&user);

        let recipient = text(&frames[routed::RECIPIENT]);
        if recipient.is_empty() {
            self.handle_local(frames).await
        } else {
            self.forward(frames).await
        }
    }

    /// Handle a request addressed to the router itself.
    async fn handle_local(&mut self, mut frames: Vec<Bytes>) -> Result<(), RouterError> {
        // Dropping the empty recipient yields the peer-level layout.
        frames.remove(routed::RECIPIENT);
        let message = match Message::decode(&frames) {
            Ok(message) => message,
            Err(err) => {
                error!(error = %err, "malformed frame set rejected");
                return Ok(());
            }
        };

        match message.subsystem.as_str() {
            subsystem::HELLO => {
                let args = vec![
                    seg(PROTOCOL_VERSION),
                    seg(&self.identity),
                    seg(&message.peer),
                ];
                let reply = local_reply(&message, subsystem::WELCOME, args);
                self.send_reply(reply).await
            }
            subsystem::PING => {
                let reply = local_reply(&message, subsystem::PONG, message.args.clone());
                self.send_reply(reply).await
            }
            _ => {
                let mut outcome = SubsystemOutcome::Unhandled;
                for handler in &mut self.subsystems {
                    if handler.name() == message.subsystem {
                        outcome = handler.handle(&message).await?;
                        break;
                    }
                }
                match outcome {
                    SubsystemOutcome::Handled => Ok(()),
                    SubsystemOutcome::Reply(reply) => self.send_reply(reply).await,
                    SubsystemOutcome::Unhandled => {
                        warn!(
                            peer = %message.peer,
                            subsystem = %message.subsystem,
                            "unknown subsystem"
                        );
                        let reply = error_reply(
                            &message.peer,
                            &message.user,
                            &message.id,
                            ErrorCode::NotImplemented,
                            &format!("unknown subsystem: {}", message.subsystem),
                            "",
                        );
                        self.send_reply(reply).await
                    }
                }
            }
        }
    }

    /// Forward a frame set to the addressed peer, converting expected
    /// transport failures into error frames back to the sender.
    async fn forward(&mut self, mut frames: Vec<Bytes>) -> Result<(), RouterError> {
        let sender = text(&frames[routed::SENDER]);
        let recipient = text(&frames[routed::RECIPIENT]);
        let user = text(&frames[routed::USER_ID]);
        let id = text(&frames[routed::MSG_ID]);

        frames.swap(routed::SENDER, routed::RECIPIENT);
        match self.sink.send(frames).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_unreachable() || err.is_again() => {
                let code = if err.is_unreachable() {
                    ErrorCode::PeerUnreachable
                } else {
                    ErrorCode::PeerTemporarilyUnavailable
                };
                debug!(
                    sender = %sender,
                    recipient = %recipient,
                    code = code.code(),
                    "forward failed, returning error frame"
                );
                let reply = error_reply(&sender, &user, &id, code, &err.to_string(), &recipient);
                self.send_reply(reply).await
            }
            Err(err) => {
                error!(recipient = %recipient, error = %err, "unexpected transport fault while forwarding");
                Err(RouterError::Transport(err))
            }
        }
    }

    /// Send router-originated frames. Best-effort: expected failures are
    /// swallowed, anything else is fatal.
    async fn send_reply(&self, frames: Vec<Bytes>) -> Result<(), RouterError> {
        match self.sink.send(frames).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_unreachable() || err.is_again() => {
                debug!(error = %err, "reply dropped");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "unexpected transport fault while replying");
                Err(RouterError::Transport(err))
            }
        }
    }
}
