//! The broker-side publish/subscribe service.
//!
//! Registered with the router as the `pubsub` subsystem. Owns the
//! [`SubscriptionTable`], enforces protected-topic authorization before any
//! fan-out, distributes publishes locally and to federated instances, and
//! reconciles peer state through diff-based synchronization.

use crate::federation::{Federation, PlatformEvent};
use crate::router::{error_reply, local_reply, RouterError, Subsystem, SubsystemOutcome};
use crate::subscriptions::SubscriptionTable;
use async_trait::async_trait;
use bytes::Bytes;
use gridbus_types::capability::{Authorizer, ProtectedTopics};
use gridbus_wire::frame::{seg, subsystem, ErrorCode, PROTOCOL_TAG};
use gridbus_wire::message::Message;
use gridbus_wire::pubsub::{
    ExternalListParams, ListEntry, ListParams, OpDecodeError, PubSubOp, PublishEnvelope, Scope,
    SubscribeParams, SubscriptionSnapshot, UnsubscribeParams,
};
use gridbus_wire::transport::FrameSink;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The pub/sub broker, keyed by the subscription table it owns.
pub struct PubSubService {
    instance_name: String,
    table: SubscriptionTable,
    protected: ProtectedTopics,
    authorizer: Arc<dyn Authorizer>,
    federation: Arc<dyn Federation>,
    sink: Arc<dyn FrameSink>,
    /// Prefixes each remote instance has expressed interest in, replaced
    /// wholesale by `external_list`.
    external: HashMap<String, HashSet<String>>,
    /// The federated prefix set we last pushed to remote instances.
    last_federated: BTreeSet<String>,
}

impl PubSubService {
    /// Create a service with an empty table and no protected topics.
    pub fn new(
        instance_name: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        authorizer: Arc<dyn Authorizer>,
        federation: Arc<dyn Federation>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            table: SubscriptionTable::new(),
            protected: ProtectedTopics::default(),
            authorizer,
            federation,
            sink,
            external: HashMap::new(),
            last_federated: BTreeSet::new(),
        }
    }

    /// Install a protected-topics table.
    pub fn with_protected_topics(mut self, protected: ProtectedTopics) -> Self {
        self.protected = protected;
        self
    }

    /// The subscription table (read-only).
    pub fn table(&self) -> &SubscriptionTable {
        &self.table
    }

    /// The cached prefix set of one remote instance.
    pub fn external_subscriptions(&self, instance: &str) -> Option<&HashSet<String>> {
        self.external.get(instance)
    }

    fn result_reply(
        &self,
        message: &Message,
        value: serde_json::Value,
    ) -> Result<SubsystemOutcome, RouterError> {
        let args = PubSubOp::RequestResponse(value).encode()?;
        Ok(SubsystemOutcome::Reply(local_reply(
            message,
            subsystem::PUBSUB,
            args,
        )))
    }

    fn error_result(
        &self,
        message: &Message,
        code: ErrorCode,
        kind: &str,
        detail: &str,
    ) -> Result<SubsystemOutcome, RouterError> {
        let args = PubSubOp::Error(gridbus_wire::pubsub::PubSubError {
            code: code.code(),
            kind: kind.to_string(),
            message: detail.to_string(),
        })
        .encode()?;
        Ok(SubsystemOutcome::Reply(local_reply(
            message,
            subsystem::PUBSUB,
            args,
        )))
    }

    async fn subscribe(
        &mut self,
        message: &Message,
        params: SubscribeParams,
    ) -> Result<SubsystemOutcome, RouterError> {
        let scope = if params.all_platforms {
            Scope::All
        } else {
            Scope::Internal
        };
        let added = self
            .table
            .insert(scope, &params.bus, &params.prefix, &message.peer);
        debug!(
            peer = %message.peer,
            prefix = %params.prefix,
            bus = %params.bus,
            ?scope,
            added,
            "subscribe"
        );
        if params.all_platforms {
            self.push_federated_set().await?;
        }
        self.result_reply(message, json!(added))
    }

    async fn unsubscribe(
        &mut self,
        message: &Message,
        params: UnsubscribeParams,
    ) -> Result<SubsystemOutcome, RouterError> {
        let removed =
            self.table
                .remove_peer_bus(&message.peer, &params.bus, params.prefix.as_deref());
        debug!(
            peer = %message.peer,
            prefix = ?params.prefix,
            bus = %params.bus,
            removed,
            "unsubscribe"
        );
        self.push_federated_set().await?;
        self.result_reply(message, json!(removed))
    }

    async fn publish(
        &mut self,
        message: &Message,
        mut envelope: PublishEnvelope,
    ) -> Result<SubsystemOutcome, RouterError> {
        // The transport identity is authoritative, not the envelope field.
        envelope.publisher = message.peer.clone();

        if let Some(required) = self.protected.required_capabilities(&envelope.topic) {
            if !required.is_empty() {
                let held = self.authorizer.capabilities(&message.user);
                if !required.is_subset(&held) {
                    warn!(
                        peer = %message.peer,
                        user = %message.user,
                        topic = %envelope.topic,
                        "publish rejected: missing capabilities"
                    );
                    return self.error_result(
                        message,
                        ErrorCode::Unauthorized,
                        "unauthorized",
                        &format!(
                            "publishing to {} requires capabilities {:?}",
                            envelope.topic, required
                        ),
                    );
                }
            }
        }

        let local = self.distribute_local(message, &envelope, false).await?;
        let external = self.distribute_external(message, &envelope).await?;
        self.result_reply(message, json!(local + external))
    }

    /// Push the envelope to every matching local subscriber. With
    /// `internal_only`, federated-in publishes skip the `all` scope.
    async fn distribute_local(
        &mut self,
        message: &Message,
        envelope: &PublishEnvelope,
        internal_only: bool,
    ) -> Result<usize, RouterError> {
        let subscribers = if internal_only {
            self.table
                .matching_in(Scope::Internal, &envelope.bus, &envelope.topic)
        } else {
            self.table.matching(&envelope.bus, &envelope.topic)
        };
        if subscribers.is_empty() {
            return Ok(0);
        }

        let push_args = PubSubOp::Publish(envelope.clone()).encode()?;
        let mut delivered = 0;
        let mut unreachable = Vec::new();
        for peer in &subscribers {
            let mut frames = vec![
                seg(peer),
                seg(""),
                seg(PROTOCOL_TAG),
                seg(&message.user),
                seg(&message.id),
                seg(subsystem::PUBSUB),
            ];
            frames.extend(push_args.iter().cloned());
            match self.sink.send(frames).await {
                Ok(()) => delivered += 1,
                Err(err) if err.is_unreachable() => unreachable.push(peer.clone()),
                Err(err) if err.is_again() => {
                    warn!(peer = %peer, topic = %envelope.topic, "subscriber congested, push dropped");
                }
                Err(err) => {
                    error!(peer = %peer, error = %err, "unexpected transport fault during fan-out");
                    return Err(RouterError::Transport(err));
                }
            }
        }

        // Self-healing: a subscriber the transport cannot reach anymore is
        // dropped from every subscription it held.
        if !unreachable.is_empty() {
            for peer in &unreachable {
                let removed = self.table.drop_peer(peer);
                warn!(peer = %peer, removed, "dropped unreachable subscriber");
            }
            self.push_federated_set().await?;
        }
        Ok(delivered)
    }

    /// Forward the publish to every remote instance whose cached prefix set
    /// matches the topic. Unreachable instances are logged, never removed
    /// here and never retried inline.
    async fn distribute_external(
        &mut self,
        message: &Message,
        envelope: &PublishEnvelope,
    ) -> Result<usize, RouterError> {
        let targets: Vec<String> = self
            .external
            .iter()
            .filter(|(_, prefixes)| {
                prefixes
                    .iter()
                    .any(|prefix| envelope.topic.starts_with(prefix.as_str()))
            })
            .map(|(instance, _)| instance.clone())
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let args = PubSubOp::ExternalPublish(envelope.clone()).encode()?;
        let mut forwarded = 0;
        for instance in targets {
            let external = Message::new(
                "",
                &*message.user,
                &*message.id,
                subsystem::PUBSUB,
                args.clone(),
            );
            match self
                .federation
                .send_external(&instance, external.encode())
                .await
            {
                Ok(()) => forwarded += 1,
                Err(err) => {
                    warn!(instance = %instance, topic = %envelope.topic, error = %err, "external publish failed");
                }
            }
        }
        Ok(forwarded)
    }

    fn list(
        &self,
        message: &Message,
        params: ListParams,
    ) -> Result<SubsystemOutcome, RouterError> {
        // Merge scopes: topic → whether the requester subscribes anywhere.
        let mut rows: BTreeMap<String, bool> = BTreeMap::new();
        for (_scope, prefix, subscribers) in self.table.entries(&params.bus) {
            let matches = if params.reverse {
                params.prefix.starts_with(prefix.as_str())
            } else {
                prefix.starts_with(&params.prefix)
            };
            if !matches {
                continue;
            }
            let is_subscriber = subscribers.contains(&message.peer);
            *rows.entry(prefix).or_insert(false) |= is_subscriber;
        }

        let entries: Vec<ListEntry> = rows
            .into_iter()
            .filter(|(_, subscribed)| !params.subscribed || *subscribed)
            .map(|(topic, subscribed)| ListEntry {
                bus: params.bus.clone(),
                topic,
                subscribed,
            })
            .collect();
        self.result_reply(message, serde_json::to_value(entries)?)
    }

    async fn synchronize(
        &mut self,
        message: &Message,
        snapshot: SubscriptionSnapshot,
    ) -> Result<SubsystemOutcome, RouterError> {
        let (added, removed) = self.table.apply_snapshot(&message.peer, &snapshot);
        debug!(peer = %message.peer, added, removed, "synchronize");
        self.push_federated_set().await?;
        self.result_reply(message, json!(true))
    }

    async fn external_publish(
        &mut self,
        message: &Message,
        envelope: PublishEnvelope,
    ) -> Result<SubsystemOutcome, RouterError> {
        // Authorization already happened at the origin instance.
        let delivered = self.distribute_local(message, &envelope, true).await?;
        if delivered == 0 {
            debug!(topic = %envelope.topic, "federated publish matched no local subscribers");
            return self.error_result(
                message,
                ErrorCode::BadRequest,
                "no_subscribers",
                &format!("no local subscribers for topic {}", envelope.topic),
            );
        }
        Ok(SubsystemOutcome::Handled)
    }

    /// Re-push the full federated prefix set when it changed. `external_list`
    /// replaces wholesale on the receiving side, so deltas are never sent.
    async fn push_federated_set(&mut self) -> Result<(), RouterError> {
        let current: BTreeSet<String> = self.table.scope_prefixes(Scope::All).into_iter().collect();
        if current == self.last_federated {
            return Ok(());
        }
        self.last_federated = current;
        let frames = self.external_list_frames()?;
        for instance in self.federation.connected_platforms() {
            if let Err(err) = self.federation.send_external(&instance, frames.clone()).await {
                warn!(instance = %instance, error = %err, "failed to push federated prefixes");
            }
        }
        Ok(())
    }

    fn external_list_frames(&self) -> Result<Vec<Bytes>, RouterError> {
        let args = PubSubOp::ExternalList(ExternalListParams {
            instance: self.instance_name.clone(),
            prefixes: self.last_federated.iter().cloned().collect(),
        })
        .encode()?;
        let message = Message::new(
            "",
            "",
            Uuid::new_v4().to_string(),
            subsystem::PUBSUB,
            args,
        );
        Ok(message.encode())
    }
}

#[async_trait]
impl Subsystem for PubSubService {
    fn name(&self) -> &str {
        subsystem::PUBSUB
    }

    async fn handle(&mut self, message: &Message) -> Result<SubsystemOutcome, RouterError> {
        let op = match PubSubOp::decode(&message.args) {
            Ok(op) => op,
            Err(OpDecodeError::UnknownOp(token)) => {
                warn!(peer = %message.peer, op = %token, "unknown pubsub operation");
                return Ok(SubsystemOutcome::Reply(error_reply(
                    &message.peer,
                    &message.user,
                    &message.id,
                    ErrorCode::NotImplemented,
                    &format!("unknown pubsub operation: {token}"),
                    "",
                )));
            }
            Err(err) => {
                warn!(peer = %message.peer, error = %err, "malformed pubsub request");
                return Ok(SubsystemOutcome::Reply(error_reply(
                    &message.peer,
                    &message.user,
                    &message.id,
                    ErrorCode::BadRequest,
                    &err.to_string(),
                    "",
                )));
            }
        };

        match op {
            PubSubOp::Subscribe(params) => self.subscribe(message, params).await,
            PubSubOp::Unsubscribe(params) => self.unsubscribe(message, params).await,
            PubSubOp::Publish(envelope) => self.publish(message, envelope).await,
            PubSubOp::List(params) => self.list(message, params),
            PubSubOp::Synchronize(snapshot) => self.synchronize(message, snapshot).await,
            PubSubOp::AuthUpdate(params) => {
                info!(users = params.capabilities.len(), "capability map replaced");
                self.authorizer.apply_update(params.capabilities);
                Ok(SubsystemOutcome::Handled)
            }
            PubSubOp::ProtectedUpdate(config) => match ProtectedTopics::compile(&config) {
                Ok(protected) => {
                    info!(rules = protected.len(), "protected-topics table replaced");
                    self.protected = protected;
                    Ok(SubsystemOutcome::Handled)
                }
                Err(err) => self.error_result(
                    message,
                    ErrorCode::BadRequest,
                    "protected_update",
                    &err.to_string(),
                ),
            },
            PubSubOp::ExternalList(params) => {
                info!(
                    instance = %params.instance,
                    prefixes = params.prefixes.len(),
                    "external subscription set replaced"
                );
                self.external
                    .insert(params.instance, params.prefixes.into_iter().collect());
                Ok(SubsystemOutcome::Handled)
            }
            PubSubOp::ExternalPublish(envelope) => self.external_publish(message, envelope).await,
            PubSubOp::Error(report) => {
                warn!(
                    peer = %message.peer,
                    code = report.code,
                    kind = %report.kind,
                    detail = %report.message,
                    "pubsub error report"
                );
                Ok(SubsystemOutcome::Handled)
            }
            PubSubOp::RequestResponse(value) => {
                debug!(peer = %message.peer, ?value, "unsolicited pubsub result, ignored");
                Ok(SubsystemOutcome::Handled)
            }
        }
    }

    async fn peer_disconnected(&mut self, peer: &str) -> Result<(), RouterError> {
        let removed = self.table.drop_peer(peer);
        if removed > 0 {
            debug!(peer = %peer, removed, "dropped subscriptions of disconnected peer");
        }
        self.push_federated_set().await
    }

    async fn platform_event(&mut self, event: &PlatformEvent) -> Result<(), RouterError> {
        match event {
            PlatformEvent::Connected(instance) => {
                // A fresh instance needs our full federated set, even when
                // it is empty, to displace anything stale it may hold.
                let frames = self.external_list_frames()?;
                if let Err(err) = self.federation.send_external(instance, frames).await {
                    warn!(instance = %instance, error = %err, "failed to announce federated prefixes");
                }
            }
            PlatformEvent::Disconnected(instance) => {
                self.external.remove(instance);
                debug!(instance = %instance, "external subscription set discarded");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbus_types::capability::{CapabilityCache, ProtectedTopicRule, ProtectedTopicsConfig};
    use gridbus_wire::transport::TransportError;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Sink that records every frame set; optionally fails sends to one peer.
    #[derive(Default)]
    struct CollectingSink {
        sent: Mutex<Vec<Vec<Bytes>>>,
        unreachable: Mutex<HashSet<String>>,
    }

    impl CollectingSink {
        fn mark_unreachable(&self, peer: &str) {
            self.unreachable
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(peer.to_string());
        }

        fn pushes_to(&self, peer: &str) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .filter(|frames| gridbus_wire::frame::text(&frames[0]) == peer)
                .map(|frames| Message::decode(&frames[1..]).unwrap())
                .collect()
        }

        fn total(&self) -> usize {
            self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    #[async_trait]
    impl FrameSink for CollectingSink {
        async fn send(&self, frames: Vec<Bytes>) -> Result<(), TransportError> {
            let destination = gridbus_wire::frame::text(&frames[0]);
            if self
                .unreachable
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&destination)
            {
                return Err(TransportError::Unreachable(destination));
            }
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(frames);
            Ok(())
        }
    }

    /// Federation stub that records external sends.
    #[derive(Default)]
    struct RecordingFederation {
        connected: Vec<String>,
        sent: Mutex<Vec<(String, Vec<Bytes>)>>,
    }

    impl RecordingFederation {
        fn connected(instances: &[&str]) -> Self {
            Self {
                connected: instances.iter().map(|s| s.to_string()).collect(),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent_ops(&self) -> Vec<(String, PubSubOp)> {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(instance, frames)| {
                    let message = Message::decode(frames).unwrap();
                    (instance.clone(), PubSubOp::decode(&message.args).unwrap())
                })
                .collect()
        }
    }

    #[async_trait]
    impl Federation for RecordingFederation {
        fn connected_platforms(&self) -> Vec<String> {
            self.connected.clone()
        }

        async fn send_external(
            &self,
            instance: &str,
            frames: Vec<Bytes>,
        ) -> Result<(), TransportError> {
            self.sent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((instance.to_string(), frames));
            Ok(())
        }

        fn subscribe_events(&self) -> mpsc::Receiver<PlatformEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }

    struct Harness {
        service: PubSubService,
        sink: Arc<CollectingSink>,
        federation: Arc<RecordingFederation>,
        cache: Arc<CapabilityCache>,
    }

    fn harness() -> Harness {
        harness_with(RecordingFederation::default(), ProtectedTopics::default())
    }

    fn harness_with(federation: RecordingFederation, protected: ProtectedTopics) -> Harness {
        let sink = Arc::new(CollectingSink::default());
        let federation = Arc::new(federation);
        let cache = Arc::new(CapabilityCache::new());
        let service = PubSubService::new(
            "site-a",
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            Arc::clone(&cache) as Arc<dyn Authorizer>,
            Arc::clone(&federation) as Arc<dyn Federation>,
        )
        .with_protected_topics(protected);
        Harness {
            service,
            sink,
            federation,
            cache,
        }
    }

    fn protected(rules: &[(&str, &[&str])]) -> ProtectedTopics {
        let config = ProtectedTopicsConfig {
            write_protect: rules
                .iter()
                .map(|(topic, caps)| ProtectedTopicRule {
                    topic: topic.to_string(),
                    capabilities: caps.iter().map(|c| c.to_string()).collect(),
                })
                .collect(),
        };
        ProtectedTopics::compile(&config).unwrap()
    }

    fn pubsub_message(peer: &str, user: &str, id: &str, op: &PubSubOp) -> Message {
        Message::new(peer, user, id, subsystem::PUBSUB, op.encode().unwrap())
    }

    fn subscribe_msg(peer: &str, prefix: &str, all_platforms: bool) -> Message {
        pubsub_message(
            peer,
            "",
            "id-sub",
            &PubSubOp::Subscribe(SubscribeParams {
                prefix: prefix.to_string(),
                bus: String::new(),
                all_platforms,
            }),
        )
    }

    fn publish_msg(peer: &str, user: &str, topic: &str) -> Message {
        pubsub_message(
            peer,
            user,
            "id-pub",
            &PubSubOp::Publish(PublishEnvelope {
                topic: topic.to_string(),
                headers: HashMap::new(),
                message: json!({"temp": 72}),
                bus: String::new(),
                publisher: String::new(),
            }),
        )
    }

    /// Decode a Reply outcome into (destination, message).
    fn reply_of(outcome: SubsystemOutcome) -> (String, Message) {
        match outcome {
            SubsystemOutcome::Reply(frames) => (
                gridbus_wire::frame::text(&frames[0]),
                Message::decode(&frames[1..]).unwrap(),
            ),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    fn result_value(outcome: SubsystemOutcome) -> serde_json::Value {
        let (_, message) = reply_of(outcome);
        match PubSubOp::decode(&message.args).unwrap() {
            PubSubOp::RequestResponse(value) => value,
            other => panic!("expected request_response, got {other:?}"),
        }
    }

    fn error_kind(outcome: SubsystemOutcome) -> (u32, String) {
        let (_, message) = reply_of(outcome);
        match PubSubOp::decode(&message.args).unwrap() {
            PubSubOp::Error(report) => (report.code, report.kind),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers_once() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.a", "devices/building1", false))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "", "devices/building1/rtu1/all"))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!(1));

        let pushes = h.sink.pushes_to("agent.a");
        assert_eq!(pushes.len(), 1);
        match PubSubOp::decode(&pushes[0].args).unwrap() {
            PubSubOp::Publish(envelope) => {
                assert_eq!(envelope.topic, "devices/building1/rtu1/all");
                assert_eq!(envelope.message, json!({"temp": 72}));
                assert_eq!(envelope.publisher, "agent.b");
            }
            other => panic!("expected publish push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_matching_topic_delivers_nothing() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.a", "devices/building2", false))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "", "devices/building1/rtu1/all"))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!(0));
        assert_eq!(h.sink.total(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_last_subscriber_removes_entry() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.a", "devices/", false))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&pubsub_message(
                "agent.a",
                "",
                "id-unsub",
                &PubSubOp::Unsubscribe(UnsubscribeParams {
                    prefix: Some("devices/".to_string()),
                    bus: String::new(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!(1));
        assert!(h.service.table().is_empty());

        let outcome = h
            .service
            .handle(&pubsub_message(
                "agent.a",
                "",
                "id-list",
                &PubSubOp::List(ListParams {
                    prefix: "devices/".to_string(),
                    bus: String::new(),
                    subscribed: false,
                    reverse: false,
                    all_platforms: false,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!([]));
    }

    #[tokio::test]
    async fn test_protected_topic_rejects_without_capability() {
        let mut h = harness_with(
            RecordingFederation::default(),
            protected(&[("alerts/critical", &["alert"])]),
        );
        h.service
            .handle(&subscribe_msg("agent.a", "alerts/", false))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "bob", "alerts/critical"))
            .await
            .unwrap();
        let (code, kind) = error_kind(outcome);
        assert_eq!(code, ErrorCode::Unauthorized.code());
        assert_eq!(kind, "unauthorized");
        // Atomic rejection: zero deliveries despite a matching subscriber.
        assert_eq!(h.sink.total(), 0);
    }

    #[tokio::test]
    async fn test_protected_topic_allows_with_capability() {
        let mut h = harness_with(
            RecordingFederation::default(),
            protected(&[("alerts/critical", &["alert"])]),
        );
        h.cache
            .grant("bob", ["alert".to_string()].into_iter().collect());
        h.service
            .handle(&subscribe_msg("agent.a", "alerts/", false))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "bob", "alerts/critical"))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!(1));
        assert_eq!(h.sink.pushes_to("agent.a").len(), 1);
    }

    #[tokio::test]
    async fn test_auth_update_replaces_grants() {
        let mut h = harness_with(
            RecordingFederation::default(),
            protected(&[("alerts/critical", &["alert"])]),
        );
        h.cache
            .grant("old-user", ["alert".to_string()].into_iter().collect());

        let mut capabilities = HashMap::new();
        capabilities.insert(
            "bob".to_string(),
            ["alert".to_string()].into_iter().collect(),
        );
        h.service
            .handle(&pubsub_message(
                "platform.auth",
                "",
                "id-auth",
                &PubSubOp::AuthUpdate(gridbus_wire::pubsub::AuthUpdateParams { capabilities }),
            ))
            .await
            .unwrap();

        // Replaced wholesale: the old grant is gone, the new one works.
        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "old-user", "alerts/critical"))
            .await
            .unwrap();
        assert_eq!(error_kind(outcome).1, "unauthorized");
        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "bob", "alerts/critical"))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!(0));
    }

    #[tokio::test]
    async fn test_protected_update_replaces_rules() {
        let mut h = harness();
        let config = ProtectedTopicsConfig {
            write_protect: vec![ProtectedTopicRule {
                topic: "alerts/critical".to_string(),
                capabilities: vec!["alert".to_string()],
            }],
        };
        h.service
            .handle(&pubsub_message(
                "platform.auth",
                "",
                "id-prot",
                &PubSubOp::ProtectedUpdate(config),
            ))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "nobody", "alerts/critical"))
            .await
            .unwrap();
        assert_eq!(error_kind(outcome).1, "unauthorized");
    }

    #[tokio::test]
    async fn test_synchronize_reconciles_and_is_idempotent() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.a", "stale/", false))
            .await
            .unwrap();

        let mut snapshot = SubscriptionSnapshot::default();
        snapshot.insert(Scope::Internal, "", "fresh/");
        let sync = pubsub_message("agent.a", "", "id-sync", &PubSubOp::Synchronize(snapshot));
        h.service.handle(&sync).await.unwrap();
        assert!(h.service.table().matching("", "stale/x").is_empty());
        assert!(h.service.table().matching("", "fresh/x").contains("agent.a"));

        // Second application changes nothing.
        let before = h.service.table().peer_snapshot("agent.a");
        h.service.handle(&sync).await.unwrap();
        assert_eq!(h.service.table().peer_snapshot("agent.a"), before);
    }

    #[tokio::test]
    async fn test_peer_disconnect_drops_everything() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.a", "devices/", false))
            .await
            .unwrap();
        h.service
            .handle(&subscribe_msg("agent.a", "alerts/", true))
            .await
            .unwrap();

        h.service.peer_disconnected("agent.a").await.unwrap();
        assert!(h.service.table().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_is_dropped_everywhere() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.gone", "devices/", false))
            .await
            .unwrap();
        h.service
            .handle(&subscribe_msg("agent.gone", "alerts/", false))
            .await
            .unwrap();
        h.sink.mark_unreachable("agent.gone");

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "", "devices/rtu1"))
            .await
            .unwrap();
        assert_eq!(result_value(outcome), json!(0));
        // Both subscriptions are gone, not just the matching one.
        assert!(h.service.table().is_empty());
    }

    #[tokio::test]
    async fn test_external_list_then_publish_forwards_once() {
        let mut h = harness();
        h.service
            .handle(&pubsub_message(
                "platform.site-b",
                "",
                "id-ext",
                &PubSubOp::ExternalList(ExternalListParams {
                    instance: "site-b".to_string(),
                    prefixes: vec!["devices/site2".to_string()],
                }),
            ))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&publish_msg("agent.b", "", "devices/site2/x"))
            .await
            .unwrap();
        // One external forward, zero local deliveries.
        assert_eq!(result_value(outcome), json!(1));
        assert_eq!(h.sink.total(), 0);

        let sent = h.federation.sent_ops();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "site-b");
        match &sent[0].1 {
            PubSubOp::ExternalPublish(envelope) => {
                assert_eq!(envelope.topic, "devices/site2/x");
            }
            other => panic!("expected external publish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_external_list_replaces_wholesale() {
        let mut h = harness();
        for prefixes in [vec!["old/".to_string()], vec!["new/".to_string()]] {
            h.service
                .handle(&pubsub_message(
                    "platform.site-b",
                    "",
                    "id-ext",
                    &PubSubOp::ExternalList(ExternalListParams {
                        instance: "site-b".to_string(),
                        prefixes,
                    }),
                ))
                .await
                .unwrap();
        }
        let cached = h.service.external_subscriptions("site-b").unwrap();
        assert!(cached.contains("new/"));
        assert!(!cached.contains("old/"));
    }

    #[tokio::test]
    async fn test_external_publish_delivers_to_internal_scope_only() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.local", "devices/", false))
            .await
            .unwrap();
        h.service
            .handle(&subscribe_msg("agent.fed", "devices/", true))
            .await
            .unwrap();

        let outcome = h
            .service
            .handle(&pubsub_message(
                "platform.site-b",
                "",
                "id-extpub",
                &PubSubOp::ExternalPublish(PublishEnvelope {
                    topic: "devices/rtu1".to_string(),
                    headers: HashMap::new(),
                    message: json!(1),
                    bus: String::new(),
                    publisher: "agent.remote".to_string(),
                }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, SubsystemOutcome::Handled));
        assert_eq!(h.sink.pushes_to("agent.local").len(), 1);
        assert!(h.sink.pushes_to("agent.fed").is_empty());
    }

    #[tokio::test]
    async fn test_external_publish_without_subscribers_reports_error() {
        let mut h = harness();
        let outcome = h
            .service
            .handle(&pubsub_message(
                "platform.site-b",
                "",
                "id-extpub",
                &PubSubOp::ExternalPublish(PublishEnvelope {
                    topic: "devices/rtu1".to_string(),
                    headers: HashMap::new(),
                    message: json!(1),
                    bus: String::new(),
                    publisher: "agent.remote".to_string(),
                }),
            ))
            .await
            .unwrap();
        let (code, kind) = error_kind(outcome);
        assert_eq!(code, ErrorCode::BadRequest.code());
        assert_eq!(kind, "no_subscribers");
    }

    #[tokio::test]
    async fn test_all_platforms_subscribe_pushes_federated_set() {
        let mut h = harness_with(
            RecordingFederation::connected(&["site-b", "site-c"]),
            ProtectedTopics::default(),
        );
        h.service
            .handle(&subscribe_msg("agent.a", "devices/", true))
            .await
            .unwrap();

        let sent = h.federation.sent_ops();
        assert_eq!(sent.len(), 2);
        for (_, op) in sent {
            match op {
                PubSubOp::ExternalList(params) => {
                    assert_eq!(params.instance, "site-a");
                    assert_eq!(params.prefixes, vec!["devices/".to_string()]);
                }
                other => panic!("expected external list, got {other:?}"),
            }
        }

        // A local-only subscribe does not change the federated set.
        h.service
            .handle(&subscribe_msg("agent.a", "local/", false))
            .await
            .unwrap();
        assert_eq!(h.federation.sent_ops().len(), 2);
    }

    #[tokio::test]
    async fn test_platform_connect_receives_current_set() {
        let mut h = harness_with(
            RecordingFederation::connected(&["site-b"]),
            ProtectedTopics::default(),
        );
        h.service
            .handle(&subscribe_msg("agent.a", "devices/", true))
            .await
            .unwrap();

        h.service
            .platform_event(&PlatformEvent::Connected("site-c".to_string()))
            .await
            .unwrap();
        let sent = h.federation.sent_ops();
        let to_c: Vec<_> = sent.iter().filter(|(i, _)| i == "site-c").collect();
        assert_eq!(to_c.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_op_is_not_implemented() {
        let mut h = harness();
        let message = Message::new(
            "agent.a",
            "",
            "id-x",
            subsystem::PUBSUB,
            vec![seg("retain"), seg("{}")],
        );
        let (_, reply) = reply_of(h.service.handle(&message).await.unwrap());
        assert_eq!(reply.subsystem, subsystem::ERROR);
        assert_eq!(
            gridbus_wire::frame::text(&reply.args[0]),
            ErrorCode::NotImplemented.code().to_string()
        );
    }

    #[tokio::test]
    async fn test_malformed_params_are_bad_request() {
        let mut h = harness();
        let message = Message::new(
            "agent.a",
            "",
            "id-x",
            subsystem::PUBSUB,
            vec![seg("subscribe"), seg("not-json")],
        );
        let (_, reply) = reply_of(h.service.handle(&message).await.unwrap());
        assert_eq!(reply.subsystem, subsystem::ERROR);
        assert_eq!(
            gridbus_wire::frame::text(&reply.args[0]),
            ErrorCode::BadRequest.code().to_string()
        );
    }

    #[tokio::test]
    async fn test_list_reverse_semantics() {
        let mut h = harness();
        h.service
            .handle(&subscribe_msg("agent.a", "devices/building1", false))
            .await
            .unwrap();
        h.service
            .handle(&subscribe_msg("agent.b", "devices/building1/rtu1/all", false))
            .await
            .unwrap();

        // Forward: stored prefixes under the queried prefix.
        let outcome = h
            .service
            .handle(&pubsub_message(
                "agent.a",
                "",
                "id-list",
                &PubSubOp::List(ListParams {
                    prefix: "devices/".to_string(),
                    bus: String::new(),
                    subscribed: false,
                    reverse: false,
                    all_platforms: false,
                }),
            ))
            .await
            .unwrap();
        let rows: Vec<ListEntry> = serde_json::from_value(result_value(outcome)).unwrap();
        assert_eq!(rows.len(), 2);

        // Reverse: stored prefixes the queried literal topic satisfies.
        let outcome = h
            .service
            .handle(&pubsub_message(
                "agent.a",
                "",
                "id-list",
                &PubSubOp::List(ListParams {
                    prefix: "devices/building1/rtu1/all".to_string(),
                    bus: String::new(),
                    subscribed: false,
                    reverse: true,
                    all_platforms: false,
                }),
            ))
            .await
            .unwrap();
        let rows: Vec<ListEntry> = serde_json::from_value(result_value(outcome)).unwrap();
        let topics: Vec<&str> = rows.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics, vec!["devices/building1", "devices/building1/rtu1/all"]);

        // Subscribed filter keeps only the requester's own entries.
        let outcome = h
            .service
            .handle(&pubsub_message(
                "agent.a",
                "",
                "id-list",
                &PubSubOp::List(ListParams {
                    prefix: String::new(),
                    bus: String::new(),
                    subscribed: true,
                    reverse: false,
                    all_platforms: false,
                }),
            ))
            .await
            .unwrap();
        let rows: Vec<ListEntry> = serde_json::from_value(result_value(outcome)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "devices/building1");
        assert!(rows[0].subscribed);
    }
}
