//! Federation seam between platform instances.
//!
//! The broker never opens connections to other instances itself; it talks to
//! a federation service through the [`Federation`] trait: which instances are
//! connected, a way to forward frames to one of them, and a stream of
//! connect/disconnect events marshaled onto the router's event loop.
//!
//! [`PlatformRegistry`] tracks the known remote instances, and
//! [`RegistryFederation`] is the in-process implementation used when several
//! platforms share a process (and by the integration tests).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gridbus_wire::transport::{FrameSink, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

/// A remote platform instance connected or disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// The named instance completed its connection.
    Connected(String),
    /// The named instance's connection went away.
    Disconnected(String),
}

/// The broker's view of the federation service.
#[async_trait]
pub trait Federation: Send + Sync {
    /// Names of the currently connected remote instances.
    fn connected_platforms(&self) -> Vec<String>;

    /// Forward a frame set to one remote instance.
    async fn send_external(&self, instance: &str, frames: Vec<Bytes>)
        -> Result<(), TransportError>;

    /// Register for connect/disconnect events. Every subscriber receives
    /// every subsequent event.
    fn subscribe_events(&self) -> mpsc::Receiver<PlatformEvent>;
}

/// Connection state of a remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Fully connected.
    Connected,
    /// Connection lost but the entry is kept for reconnect.
    Disconnected,
}

/// An entry for one known remote instance.
#[derive(Debug, Clone)]
pub struct InstanceEntry {
    /// Instance name.
    pub name: String,
    /// Connection state.
    pub state: InstanceState,
    /// When the instance first connected.
    pub connected_at: DateTime<Utc>,
}

/// Thread-safe registry of known remote platform instances.
#[derive(Debug, Clone, Default)]
pub struct PlatformRegistry {
    instances: Arc<RwLock<HashMap<String, InstanceEntry>>>,
}

impl PlatformRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or reconnect an instance.
    pub fn add(&self, name: &str) {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances
            .entry(name.to_string())
            .and_modify(|entry| entry.state = InstanceState::Connected)
            .or_insert_with(|| InstanceEntry {
                name: name.to_string(),
                state: InstanceState::Connected,
                connected_at: Utc::now(),
            });
    }

    /// Mark an instance as disconnected, keeping its entry.
    pub fn mark_disconnected(&self, name: &str) {
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = instances.get_mut(name) {
            entry.state = InstanceState::Disconnected;
        }
    }

    /// Snapshot of one instance.
    pub fn get(&self, name: &str) -> Option<InstanceEntry> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.get(name).cloned()
    }

    /// Names of connected instances.
    pub fn connected(&self) -> Vec<String> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances
            .values()
            .filter(|entry| entry.state == InstanceState::Connected)
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Number of connected instances.
    pub fn connected_count(&self) -> usize {
        self.connected().len()
    }

    /// Total entries, including disconnected.
    pub fn total_count(&self) -> usize {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.len()
    }
}

/// In-process [`Federation`]: remote instances are frame sinks registered
/// under their names. Connecting and disconnecting emit platform events.
#[derive(Default)]
pub struct RegistryFederation {
    registry: PlatformRegistry,
    links: DashMap<String, Arc<dyn FrameSink>>,
    subscribers: Mutex<Vec<mpsc::Sender<PlatformEvent>>>,
}

/// Capacity of each event subscriber channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

impl RegistryFederation {
    /// Create an empty federation.
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying instance registry.
    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    /// Register a connected remote instance reachable through `link`.
    pub fn connect(&self, instance: &str, link: Arc<dyn FrameSink>) {
        self.links.insert(instance.to_string(), link);
        self.registry.add(instance);
        self.emit(PlatformEvent::Connected(instance.to_string()));
    }

    /// Drop a remote instance's link.
    pub fn disconnect(&self, instance: &str) {
        self.links.remove(instance);
        self.registry.mark_disconnected(instance);
        self.emit(PlatformEvent::Disconnected(instance.to_string()));
    }

    fn emit(&self, event: PlatformEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(?event, "platform event subscriber is full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

#[async_trait]
impl Federation for RegistryFederation {
    fn connected_platforms(&self) -> Vec<String> {
        self.registry.connected()
    }

    async fn send_external(
        &self,
        instance: &str,
        frames: Vec<Bytes>,
    ) -> Result<(), TransportError> {
        let link = self
            .links
            .get(instance)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::Unreachable(instance.to_string()))?;
        link.send(frames).await
    }

    fn subscribe_events(&self) -> mpsc::Receiver<PlatformEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&self, _frames: Vec<Bytes>) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_connect_disconnect() {
        let registry = PlatformRegistry::new();
        registry.add("site-b");
        assert_eq!(registry.connected_count(), 1);

        registry.mark_disconnected("site-b");
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.total_count(), 1);

        registry.add("site-b");
        assert_eq!(registry.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_federation_events_and_links() {
        let federation = RegistryFederation::new();
        let mut events = federation.subscribe_events();

        federation.connect("site-b", Arc::new(NullSink));
        assert_eq!(federation.connected_platforms(), vec!["site-b".to_string()]);
        assert_eq!(
            events.recv().await,
            Some(PlatformEvent::Connected("site-b".to_string()))
        );

        federation
            .send_external("site-b", vec![Bytes::from_static(b"x")])
            .await
            .unwrap();

        federation.disconnect("site-b");
        assert_eq!(
            events.recv().await,
            Some(PlatformEvent::Disconnected("site-b".to_string()))
        );
        let err = federation
            .send_external("site-b", vec![Bytes::from_static(b"x")])
            .await
            .unwrap_err();
        assert!(err.is_unreachable());
    }
}
