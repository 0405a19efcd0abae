//! The agent-side pub/sub client.
//!
//! Mirrors this process's subscriptions in a two-namespace table of
//! `(bus, prefix) → callbacks`. The table is mutated before the wire message
//! goes out, so a publish issued by the same process right after a local
//! subscribe is deliverable without waiting for broker acknowledgment. On
//! every successful (re)connection the whole table is replayed via
//! `synchronize`, which the broker reconciles diff-wise and idempotently.

use crate::connection::Connection;
use crate::error::AgentResult;
use gridbus_wire::frame::{subsystem, PROTOCOL_VERSION};
use gridbus_wire::message::Message;
use gridbus_wire::pending::PendingReply;
use gridbus_wire::pubsub::{
    PubSubOp, PublishEnvelope, Scope, SubscribeParams, SubscriptionSnapshot, UnsubscribeParams,
    HEADER_MAX_COMPATIBLE_VERSION, HEADER_MIN_COMPATIBLE_VERSION,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// A callback invoked for every matching publish push.
pub type PublishCallback = Arc<dyn Fn(&PublishEnvelope) + Send + Sync>;

/// Identifies one registered callback for later removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: Uuid,
    scope: Scope,
    bus: String,
    prefix: String,
}

impl SubscriptionHandle {
    /// The prefix this handle subscribes to.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The bus this handle subscribes on.
    pub fn bus(&self) -> &str {
        &self.bus
    }
}

struct CallbackEntry {
    id: Uuid,
    callback: PublishCallback,
}

#[derive(Default)]
struct CallbackTable {
    internal: HashMap<(String, String), Vec<CallbackEntry>>,
    all: HashMap<(String, String), Vec<CallbackEntry>>,
}

impl CallbackTable {
    fn scope(&self, scope: Scope) -> &HashMap<(String, String), Vec<CallbackEntry>> {
        match scope {
            Scope::Internal => &self.internal,
            Scope::All => &self.all,
        }
    }

    fn scope_mut(&mut self, scope: Scope) -> &mut HashMap<(String, String), Vec<CallbackEntry>> {
        match scope {
            Scope::Internal => &mut self.internal,
            Scope::All => &mut self.all,
        }
    }
}

/// The agent's mirror of its own subscriptions.
pub struct PubSubClient {
    connection: Connection,
    table: RwLock<CallbackTable>,
}

impl PubSubClient {
    /// Create a client over an established connection.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            table: RwLock::new(CallbackTable::default()),
        }
    }

    /// Register a callback for `prefix` on `bus` and tell the broker.
    ///
    /// The local table is updated first; the wire message follows.
    pub async fn subscribe(
        &self,
        bus: &str,
        prefix: &str,
        all_platforms: bool,
        callback: PublishCallback,
    ) -> AgentResult<SubscriptionHandle> {
        let scope = if all_platforms {
            Scope::All
        } else {
            Scope::Internal
        };
        let id = Uuid::new_v4();
        {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            table
                .scope_mut(scope)
                .entry((bus.to_string(), prefix.to_string()))
                .or_default()
                .push(CallbackEntry { id, callback });
        }
        debug!(prefix = %prefix, bus = %bus, all_platforms, "subscribe");
        self.send_op(&PubSubOp::Subscribe(SubscribeParams {
            prefix: prefix.to_string(),
            bus: bus.to_string(),
            all_platforms,
        }))
        .await?;
        Ok(SubscriptionHandle {
            id,
            scope,
            bus: bus.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Remove one callback. The broker is told only when the last callback
    /// for `(bus, prefix)` is gone.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> AgentResult<()> {
        let last = {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            let map = table.scope_mut(handle.scope);
            let key = (handle.bus.clone(), handle.prefix.clone());
            match map.get_mut(&key) {
                Some(entries) => {
                    entries.retain(|entry| entry.id != handle.id);
                    if entries.is_empty() {
                        map.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last {
            self.send_op(&PubSubOp::Unsubscribe(UnsubscribeParams {
                prefix: Some(handle.prefix),
                bus: handle.bus,
            }))
            .await?;
        }
        Ok(())
    }

    /// Drop every subscription on `bus`, locally and at the broker.
    pub async fn unsubscribe_all(&self, bus: &str) -> AgentResult<()> {
        {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            for scope in Scope::ALL_SCOPES {
                table.scope_mut(scope).retain(|(b, _), _| b != bus);
            }
        }
        self.send_op(&PubSubOp::Unsubscribe(UnsubscribeParams {
            prefix: None,
            bus: bus.to_string(),
        }))
        .await
    }

    /// Publish a message. The compatibility headers are always stamped so an
    /// incompatible broker can reject cleanly instead of misreading the
    /// payload shape. The returned handle resolves to the broker's
    /// subscriber count; dropping it is fine.
    pub async fn publish(
        &self,
        bus: &str,
        topic: &str,
        mut headers: HashMap<String, serde_json::Value>,
        message: serde_json::Value,
    ) -> AgentResult<PendingReply> {
        headers.insert(
            HEADER_MIN_COMPATIBLE_VERSION.to_string(),
            json!(PROTOCOL_VERSION),
        );
        headers.insert(
            HEADER_MAX_COMPATIBLE_VERSION.to_string(),
            json!(PROTOCOL_VERSION),
        );
        let envelope = PublishEnvelope {
            topic: topic.to_string(),
            headers,
            message,
            bus: bus.to_string(),
            publisher: self.connection.identity().to_string(),
        };
        let request = Message::new(
            "",
            self.connection.auth_token(),
            Uuid::new_v4().to_string(),
            subsystem::PUBSUB,
            PubSubOp::Publish(envelope).encode()?,
        );
        self.connection.request(&request).await
    }

    /// Replay the full local table to the broker. Safe to repeat: the
    /// broker's reconciliation is diff-based and idempotent.
    pub async fn synchronize(&self) -> AgentResult<()> {
        let snapshot = self.snapshot();
        debug!("synchronizing subscription state with broker");
        self.send_op(&PubSubOp::Synchronize(snapshot)).await
    }

    /// The current local subscription state.
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = SubscriptionSnapshot::default();
        for scope in Scope::ALL_SCOPES {
            for (bus, prefix) in table.scope(scope).keys() {
                snapshot.insert(scope, bus, prefix);
            }
        }
        snapshot
    }

    /// Walk both namespaces and invoke every callback whose prefix is a
    /// string-prefix of the pushed topic. Returns how many fired.
    pub fn dispatch(&self, envelope: &PublishEnvelope) -> usize {
        // Collect under the lock, invoke outside it, so a callback may
        // subscribe or publish without deadlocking.
        let callbacks: Vec<PublishCallback> = {
            let table = self.table.read().unwrap_or_else(|e| e.into_inner());
            Scope::ALL_SCOPES
                .iter()
                .flat_map(|scope| table.scope(*scope).iter())
                .filter(|((bus, prefix), _)| {
                    bus == &envelope.bus && envelope.topic.starts_with(prefix.as_str())
                })
                .flat_map(|(_, entries)| entries.iter().map(|entry| Arc::clone(&entry.callback)))
                .collect()
        };
        for callback in &callbacks {
            callback(envelope);
        }
        callbacks.len()
    }

    async fn send_op(&self, op: &PubSubOp) -> AgentResult<()> {
        let message = Message::new(
            "",
            self.connection.auth_token(),
            Uuid::new_v4().to_string(),
            subsystem::PUBSUB,
            op.encode()?,
        );
        self.connection.send(&message).await
    }
}
