//! GridBus central router and pub/sub broker.
//!
//! Every platform process talks to the router over the framed GridBus
//! Protocol; the router answers local requests, forwards peer-to-peer
//! frames, and hosts the [`pubsub::PubSubService`] that fans publishes out
//! to local subscribers and federated instances.
//!
//! ## Architecture
//!
//! - **Router**: validation, local subsystems, forwarding, error conversion
//! - **SubscriptionTable**: `scope → bus → prefix → subscribers`, loop-owned
//! - **PubSubService**: subscribe/unsubscribe/publish/list/synchronize plus
//!   protected-topic authorization and federation fan-out
//! - **Federation**: the seam toward other platform instances

pub mod config;
pub mod federation;
pub mod pubsub;
pub mod router;
pub mod subscriptions;

pub use federation::{Federation, PlatformEvent, PlatformRegistry, RegistryFederation};
pub use pubsub::PubSubService;
pub use router::{Router, RouterError, Subsystem, SubsystemOutcome, UserIdResolver};
pub use subscriptions::SubscriptionTable;
