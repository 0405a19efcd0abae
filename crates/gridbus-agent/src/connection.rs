//! The agent's connection to its platform router.
//!
//! A [`Connection`] owns the sending half of the transport and the
//! pending-request map. Its receive loop dispatches inbound pub/sub pushes
//! to the [`PubSubClient`](crate::pubsub::PubSubClient) and correlates every
//! other frame with an outstanding request by message id.

use crate::error::{AgentError, AgentResult};
use crate::pubsub::PubSubClient;
use gridbus_types::config::AgentConfig;
use gridbus_wire::frame::{subsystem, text};
use gridbus_wire::message::Message;
use gridbus_wire::pending::{PendingReply, PendingRequests};
use gridbus_wire::pubsub::PubSubOp;
use gridbus_wire::transport::{FrameSink, FrameSource, Inbound};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an unanswered request registration is kept before expiry.
const REQUEST_TTL: Duration = Duration::from_secs(300);
/// How often the receive loop reclaims expired registrations.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// The router's answer to a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    /// Protocol version the router speaks.
    pub version: String,
    /// The router's own identity on the bus.
    pub router_identity: String,
}

struct ConnectionInner {
    identity: String,
    auth_token: String,
    sink: Arc<dyn FrameSink>,
    pending: PendingRequests,
    handshake_timeout: Duration,
}

/// A cheaply cloneable handle to the agent's router connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection for the configured identity over `sink`.
    pub fn new(config: &AgentConfig, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                identity: config.identity.clone(),
                auth_token: config.auth_token.clone(),
                sink,
                pending: PendingRequests::new(),
                handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            }),
        }
    }

    /// The identity this agent presents to the router.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// The credential stamped into the user-id slot of outbound frames.
    pub fn auth_token(&self) -> &str {
        &self.inner.auth_token
    }

    /// The reply-correlation map.
    pub fn pending(&self) -> &PendingRequests {
        &self.inner.pending
    }

    /// Send a message. `message.peer` names the recipient; empty addresses
    /// the router itself. Backpressure surfaces as an error to the caller;
    /// retrying is the caller's decision.
    pub async fn send(&self, message: &Message) -> AgentResult<()> {
        self.inner.sink.send(message.encode()).await?;
        Ok(())
    }

    /// Send a message and return the handle its reply will resolve.
    ///
    /// The id is registered before the send so a fast reply cannot race the
    /// registration. A failed send leaves the registration behind; expiry
    /// reclaims it.
    pub async fn request(&self, message: &Message) -> AgentResult<PendingReply> {
        let reply = self.inner.pending.register(&*message.id);
        self.send(message).await?;
        Ok(reply)
    }

    /// Perform the connection handshake.
    ///
    /// No acknowledgment within the configured window is fatal: a
    /// half-connected agent silently retrying forever is worse than a
    /// visible, debuggable shutdown.
    pub async fn hello(&self) -> AgentResult<Welcome> {
        let message = Message::new(
            "",
            self.auth_token(),
            Uuid::new_v4().to_string(),
            subsystem::HELLO,
            vec![],
        );
        let reply = self.request(&message).await?;
        let answer = match timeout(self.inner.handshake_timeout, reply.recv()).await {
            Err(_) => return Err(AgentError::HandshakeTimeout),
            Ok(None) => return Err(AgentError::ConnectionClosed),
            Ok(Some(answer)) => answer,
        };
        if answer.subsystem != subsystem::WELCOME || answer.args.len() < 2 {
            return Err(AgentError::Handshake(format!(
                "unexpected handshake reply: {}",
                answer.subsystem
            )));
        }
        let welcome = Welcome {
            version: text(&answer.args[0]),
            router_identity: text(&answer.args[1]),
        };
        info!(
            identity = %self.inner.identity,
            router = %welcome.router_identity,
            version = %welcome.version,
            "connected to router"
        );
        Ok(welcome)
    }

    /// Run the receive loop until the transport shuts down.
    ///
    /// Pub/sub pushes go to `pubsub`; a push matching no local callback
    /// triggers a resynchronization, healing a broker view that drifted
    /// ahead of this process. Everything else resolves a pending request.
    pub async fn run<S: FrameSource>(&self, mut source: S, pubsub: &PubSubClient) -> AgentResult<()> {
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                inbound = source.recv() => match inbound {
                    Some(Inbound::Frames(frames)) => self.dispatch(frames, pubsub).await?,
                    Some(Inbound::Disconnected(peer)) => {
                        debug!(peer = %peer, "peer disconnect notification");
                    }
                    None => {
                        info!(identity = %self.inner.identity, "transport closed, receive loop ending");
                        return Ok(());
                    }
                },
                _ = purge.tick() => {
                    let purged = self.inner.pending.purge_expired(REQUEST_TTL);
                    if purged > 0 {
                        debug!(purged, "expired pending requests reclaimed");
                    }
                }
            }
        }
    }

    async fn dispatch(&self, frames: Vec<bytes::Bytes>, pubsub: &PubSubClient) -> AgentResult<()> {
        let message = match Message::decode(&frames) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "malformed inbound frame set dropped");
                return Ok(());
            }
        };

        if message.subsystem == subsystem::PUBSUB {
            match PubSubOp::decode(&message.args) {
                Ok(PubSubOp::Publish(envelope)) => {
                    let fired = pubsub.dispatch(&envelope);
                    if fired == 0 {
                        warn!(
                            topic = %envelope.topic,
                            "push matched no local callbacks, resynchronizing"
                        );
                        pubsub.synchronize().await?;
                    }
                }
                // Operation results and error reports are replies.
                Ok(_) => {
                    self.inner.pending.fulfill(message);
                }
                Err(err) => {
                    warn!(error = %err, "malformed pubsub push dropped");
                }
            }
            return Ok(());
        }

        // welcome / pong / error / peer replies all correlate by id.
        let id = message.id.clone();
        if !self.inner.pending.fulfill(message) {
            debug!(id = %id, "reply with no outstanding request, dropped");
        }
        Ok(())
    }
}
