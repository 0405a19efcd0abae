//! Configuration structs for router and agent processes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Router process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Peer identity the router answers to on the bus.
    pub identity: String,
    /// Platform instance name, used when federating with other instances.
    pub instance_name: String,
    /// Optional path to the protected-topics JSON document.
    pub protected_topics_path: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            identity: "gridbus.router".to_string(),
            instance_name: "gridbus".to_string(),
            protected_topics_path: None,
        }
    }
}

/// Agent process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Peer identity this agent presents to the router.
    pub identity: String,
    /// Credential presented in the user-id slot of every frame; the router
    /// resolves it to an authenticated user. Empty means anonymous.
    pub auth_token: String,
    /// Handshake timeout in milliseconds. Expiry is fatal to the agent.
    pub handshake_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            auth_token: String::new(),
            handshake_timeout_ms: 10_000,
        }
    }
}
