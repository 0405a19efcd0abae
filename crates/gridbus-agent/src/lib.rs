//! GridBus agent-side runtime.
//!
//! An agent process owns one [`connection::Connection`] to its platform
//! router and a [`pubsub::PubSubClient`] mirroring its subscriptions. The
//! client mutates its local table before telling the broker, replays the
//! whole table on every (re)connect, and resynchronizes itself when an
//! inbound push finds no matching callback.

pub mod connection;
pub mod error;
pub mod pubsub;

pub use connection::{Connection, Welcome};
pub use error::{AgentError, AgentResult};
pub use pubsub::{PubSubClient, PublishCallback, SubscriptionHandle};
