//! GridBus Protocol (GBP) — the framed wire model connecting every platform
//! process to the central router.
//!
//! ## Architecture
//!
//! - **Frame model**: multipart byte-segment sequences with a fixed header
//!   layout and structural validation ([`message::Message`]).
//! - **Transport seams**: [`transport::FrameSink`] / [`transport::FrameSource`]
//!   abstract the addressable message bus; concrete socket bindings live
//!   outside this workspace.
//! - **Pub/sub vocabulary**: [`pubsub::PubSubOp`] is the operation codec
//!   shared by the broker and the agent-side client.
//! - **Reply correlation**: [`pending::PendingRequests`] maps message ids to
//!   single-fulfillment reply handles with explicit expiry.
//! - **Loopback**: [`memory::MemoryBus`] is an in-process transport for
//!   same-process agents and integration tests.

pub mod frame;
pub mod memory;
pub mod message;
pub mod pending;
pub mod pubsub;
pub mod transport;

pub use frame::{ErrorCode, PROTOCOL_TAG, PROTOCOL_VERSION};
pub use message::{Message, MessageError, MessageErrorKind};
pub use pending::{PendingReply, PendingRequests};
pub use pubsub::{PubSubOp, PublishEnvelope, SubscriptionSnapshot};
pub use transport::{FrameSink, FrameSource, Inbound, TransportError};
