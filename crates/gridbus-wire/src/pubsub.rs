//! Publish/subscribe operation codec.
//!
//! Pub/sub requests ride the `pubsub` subsystem with the operation token as
//! the first argument segment and JSON parameters as the second. The token
//! set is closed: an unrecognized token is a decode error, answered with a
//! bad-request reply rather than silently ignored.

use crate::frame::seg;
use bytes::Bytes;
use gridbus_types::capability::{CapabilitySet, ProtectedTopicsConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Header stamped on every publish: lowest broker protocol level the
/// payload shape is compatible with.
pub const HEADER_MIN_COMPATIBLE_VERSION: &str = "min_compatible_version";
/// Header stamped on every publish: highest compatible broker protocol level.
pub const HEADER_MAX_COMPATIBLE_VERSION: &str = "max_compatible_version";

/// Subscription scope namespace.
///
/// `Internal` holds interest registered against the local platform;
/// `All` holds interest registered with `all_platforms`, which the broker
/// also advertises to federated instances. Publishes federated in from
/// another instance are delivered against the `internal` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Local-only interest.
    Internal,
    /// Interest spanning federated instances.
    All,
}

impl Scope {
    /// Both scopes, in match order.
    pub const ALL_SCOPES: [Scope; 2] = [Scope::Internal, Scope::All];
}

/// Parameters of a `subscribe` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    /// Topic prefix the subscriber is interested in.
    pub prefix: String,
    /// Message bus the interest applies to.
    #[serde(default)]
    pub bus: String,
    /// Propagate this interest to federated instances.
    #[serde(default)]
    pub all_platforms: bool,
}

/// Parameters of an `unsubscribe` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    /// Prefix to drop; `None` drops every prefix the peer holds on `bus`.
    pub prefix: Option<String>,
    /// Message bus the removal applies to.
    #[serde(default)]
    pub bus: String,
}

/// A published message with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    /// Full topic the message was published to.
    pub topic: String,
    /// Publisher-supplied headers, including the compatibility stamps.
    #[serde(default)]
    pub headers: HashMap<String, serde_json::Value>,
    /// The message body.
    pub message: serde_json::Value,
    /// Message bus the publish was issued on.
    #[serde(default)]
    pub bus: String,
    /// Identity of the publishing peer.
    #[serde(default)]
    pub publisher: String,
}

/// Parameters of a `list` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListParams {
    /// Prefix (or literal topic, with `reverse`) to match against.
    pub prefix: String,
    /// Message bus to inspect.
    #[serde(default)]
    pub bus: String,
    /// Only return entries where the requesting peer is a subscriber.
    #[serde(default)]
    pub subscribed: bool,
    /// Invert the match direction: stored prefixes that the given literal
    /// topic satisfies, instead of topics under the given prefix.
    #[serde(default)]
    pub reverse: bool,
    /// Reserved for federated listing.
    #[serde(default)]
    pub all_platforms: bool,
}

/// One `list` result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Message bus of the entry.
    pub bus: String,
    /// Stored topic prefix.
    pub topic: String,
    /// Whether the requesting peer subscribes to it.
    pub subscribed: bool,
}

/// A peer's complete subscription state, replayed on (re)connect and
/// reconciled diff-wise by the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// `internal`-scope prefixes, keyed by bus.
    #[serde(default)]
    pub internal: HashMap<String, HashSet<String>>,
    /// `all`-scope prefixes, keyed by bus.
    #[serde(default)]
    pub all: HashMap<String, HashSet<String>>,
}

impl SubscriptionSnapshot {
    /// Record a prefix under the given scope and bus.
    pub fn insert(&mut self, scope: Scope, bus: &str, prefix: &str) {
        self.scope_mut(scope)
            .entry(bus.to_string())
            .or_default()
            .insert(prefix.to_string());
    }

    /// The per-bus prefix map of one scope.
    pub fn scope(&self, scope: Scope) -> &HashMap<String, HashSet<String>> {
        match scope {
            Scope::Internal => &self.internal,
            Scope::All => &self.all,
        }
    }

    fn scope_mut(&mut self, scope: Scope) -> &mut HashMap<String, HashSet<String>> {
        match scope {
            Scope::Internal => &mut self.internal,
            Scope::All => &mut self.all,
        }
    }

    /// True when no prefix is recorded in either scope.
    pub fn is_empty(&self) -> bool {
        self.internal.values().all(HashSet::is_empty) && self.all.values().all(HashSet::is_empty)
    }
}

/// Parameters of an `auth_update` operation: wholesale replacement of the
/// user capability map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthUpdateParams {
    /// Capabilities per user id.
    pub capabilities: HashMap<String, CapabilitySet>,
}

/// Parameters of an `external_list` operation: the full set of prefixes a
/// remote instance is interested in, replacing any previously cached set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalListParams {
    /// Remote instance name.
    pub instance: String,
    /// Its complete federated prefix set.
    pub prefixes: Vec<String>,
}

/// A pub/sub-level error report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubError {
    /// Numeric protocol error code.
    pub code: u32,
    /// Stable machine-readable kind, e.g. `unauthorized`, `no_subscribers`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

/// The closed set of pub/sub operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubOp {
    /// Register interest in a topic prefix.
    Subscribe(SubscribeParams),
    /// Drop interest in one prefix, or all of a peer's prefixes on a bus.
    Unsubscribe(UnsubscribeParams),
    /// Distribute a message to matching subscribers.
    Publish(PublishEnvelope),
    /// Query stored prefixes.
    List(ListParams),
    /// Reconcile the broker's view of a peer with a full snapshot.
    Synchronize(SubscriptionSnapshot),
    /// Replace the user capability map.
    AuthUpdate(AuthUpdateParams),
    /// Replace the protected-topics table.
    ProtectedUpdate(ProtectedTopicsConfig),
    /// A remote instance's full federated prefix set.
    ExternalList(ExternalListParams),
    /// A publish forwarded from another instance.
    ExternalPublish(PublishEnvelope),
    /// An error report.
    Error(PubSubError),
    /// The result value of a completed operation.
    RequestResponse(serde_json::Value),
}

/// Why pub/sub argument segments failed to decode.
#[derive(Debug, Error)]
pub enum OpDecodeError {
    /// No operation token segment was present.
    #[error("missing pubsub operation token")]
    MissingOp,

    /// The token is not part of the closed operation set.
    #[error("unknown pubsub operation: {0}")]
    UnknownOp(String),

    /// The operation requires a parameter segment that was absent.
    #[error("missing parameters for pubsub operation {0}")]
    MissingParams(&'static str),

    /// The parameter segment was not valid JSON for the operation.
    #[error("invalid parameters for pubsub operation {op}: {source}")]
    Params {
        /// Operation token being decoded.
        op: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl PubSubOp {
    /// The wire token of this operation.
    pub fn token(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Publish(_) => "publish",
            Self::List(_) => "list",
            Self::Synchronize(_) => "synchronize",
            Self::AuthUpdate(_) => "auth_update",
            Self::ProtectedUpdate(_) => "protected_update",
            Self::ExternalList(_) => "external_list",
            Self::ExternalPublish(_) => "external_publish",
            Self::Error(_) => "error",
            Self::RequestResponse(_) => "request_response",
        }
    }

    /// Encode into `[token, json-params]` argument segments.
    pub fn encode(&self) -> Result<Vec<Bytes>, serde_json::Error> {
        let params = match self {
            Self::Subscribe(p) => serde_json::to_vec(p)?,
            Self::Unsubscribe(p) => serde_json::to_vec(p)?,
            Self::Publish(p) => serde_json::to_vec(p)?,
            Self::List(p) => serde_json::to_vec(p)?,
            Self::Synchronize(p) => serde_json::to_vec(p)?,
            Self::AuthUpdate(p) => serde_json::to_vec(p)?,
            Self::ProtectedUpdate(p) => serde_json::to_vec(p)?,
            Self::ExternalList(p) => serde_json::to_vec(p)?,
            Self::ExternalPublish(p) => serde_json::to_vec(p)?,
            Self::Error(p) => serde_json::to_vec(p)?,
            Self::RequestResponse(p) => serde_json::to_vec(p)?,
        };
        Ok(vec![seg(self.token()), Bytes::from(params)])
    }

    /// Decode argument segments into an operation.
    pub fn decode(args: &[Bytes]) -> Result<Self, OpDecodeError> {
        let token_segment = args.first().ok_or(OpDecodeError::MissingOp)?;
        let token = crate::frame::text(token_segment);
        match token.as_str() {
            "subscribe" => Ok(Self::Subscribe(params(args, "subscribe")?)),
            "unsubscribe" => Ok(Self::Unsubscribe(params(args, "unsubscribe")?)),
            "publish" => Ok(Self::Publish(params(args, "publish")?)),
            "list" => Ok(Self::List(params(args, "list")?)),
            "synchronize" => Ok(Self::Synchronize(params(args, "synchronize")?)),
            "auth_update" => Ok(Self::AuthUpdate(params(args, "auth_update")?)),
            "protected_update" => Ok(Self::ProtectedUpdate(params(args, "protected_update")?)),
            "external_list" => Ok(Self::ExternalList(params(args, "external_list")?)),
            "external_publish" => Ok(Self::ExternalPublish(params(args, "external_publish")?)),
            "error" => Ok(Self::Error(params(args, "error")?)),
            "request_response" => Ok(Self::RequestResponse(params(args, "request_response")?)),
            _ => Err(OpDecodeError::UnknownOp(token)),
        }
    }
}

/// Parse the JSON parameter segment of an operation.
fn params<T: serde::de::DeserializeOwned>(
    args: &[Bytes],
    op: &'static str,
) -> Result<T, OpDecodeError> {
    let segment = args.get(1).ok_or(OpDecodeError::MissingParams(op))?;
    serde_json::from_slice(segment).map_err(|source| OpDecodeError::Params { op, source })
}
