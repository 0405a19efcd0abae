//! Capability-based publish authorization.
//!
//! GridBus protects publish topics with capabilities: a protected topic can
//! only be published by a user whose capability set covers every capability
//! the matching rule requires. Rules are either literal topic strings or
//! `/regex/`-delimited patterns; literal rules are consulted first, then
//! regex rules in declaration order, first match wins.

use crate::error::{GridBusError, GridBusResult};
use dashmap::DashMap;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The set of capabilities held by a platform user.
pub type CapabilitySet = HashSet<String>;

/// One protected-topic rule: a topic pattern and the capabilities it requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedTopicRule {
    /// Literal topic string, or a `/regex/`-delimited pattern.
    pub topic: String,
    /// Capabilities a publisher must hold. Empty means unprotected.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// The on-disk protected-topics document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectedTopicsConfig {
    /// Rules guarding publishes.
    #[serde(rename = "write-protect", default)]
    pub write_protect: Vec<ProtectedTopicRule>,
}

/// Compiled protected-topics table.
///
/// Literal rules are indexed for exact lookup; regex rules keep their
/// declaration order so the first matching pattern wins.
#[derive(Debug, Default)]
pub struct ProtectedTopics {
    literal: HashMap<String, CapabilitySet>,
    patterns: Vec<(Regex, CapabilitySet)>,
}

impl ProtectedTopics {
    /// Compile a rule document into a lookup table.
    ///
    /// Fails if a `/regex/`-delimited pattern does not compile.
    pub fn compile(config: &ProtectedTopicsConfig) -> GridBusResult<Self> {
        let mut table = Self::default();
        for rule in &config.write_protect {
            let caps: CapabilitySet = rule.capabilities.iter().cloned().collect();
            if let Some(pattern) = regex_pattern(&rule.topic) {
                let regex = Regex::new(pattern).map_err(|e| {
                    GridBusError::Config(format!(
                        "invalid protected-topic pattern {:?}: {e}",
                        rule.topic
                    ))
                })?;
                table.patterns.push((regex, caps));
            } else {
                // First literal rule for a topic wins.
                table.literal.entry(rule.topic.clone()).or_insert(caps);
            }
        }
        Ok(table)
    }

    /// Capabilities required to publish to `topic`, or `None` if unprotected.
    pub fn required_capabilities(&self, topic: &str) -> Option<&CapabilitySet> {
        if let Some(caps) = self.literal.get(topic) {
            return Some(caps);
        }
        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(topic))
            .map(|(_, caps)| caps)
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.literal.len() + self.patterns.len()
    }

    /// True when no rules are present.
    pub fn is_empty(&self) -> bool {
        self.literal.is_empty() && self.patterns.is_empty()
    }
}

/// Strip the `/.../` delimiters from a regex rule, if present.
fn regex_pattern(topic: &str) -> Option<&str> {
    let trimmed = topic.strip_prefix('/')?;
    let pattern = trimmed.strip_suffix('/')?;
    if pattern.is_empty() {
        None
    } else {
        Some(pattern)
    }
}

/// Resolves the capabilities held by a platform user.
pub trait Authorizer: Send + Sync {
    /// The capability set of `user_id`. Unknown users get the empty set.
    fn capabilities(&self, user_id: &str) -> CapabilitySet;

    /// Replace the full grant map when the auth subsystem pushes an update.
    fn apply_update(&self, grants: HashMap<String, CapabilitySet>);
}

/// Default [`Authorizer`]: a concurrent cache of user capability grants,
/// replaced wholesale when the auth subsystem pushes an update.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    grants: DashMap<String, CapabilitySet>,
}

impl CapabilityCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            grants: DashMap::new(),
        }
    }

    /// Grant capabilities to a single user.
    pub fn grant(&self, user_id: impl Into<String>, capabilities: CapabilitySet) {
        self.grants.insert(user_id.into(), capabilities);
    }

    /// Replace every grant with the given map. Users absent from the map
    /// lose their capabilities.
    pub fn replace_all(&self, grants: HashMap<String, CapabilitySet>) {
        self.grants.clear();
        for (user, caps) in grants {
            self.grants.insert(user, caps);
        }
    }
}

impl Authorizer for CapabilityCache {
    fn capabilities(&self, user_id: &str) -> CapabilitySet {
        self.grants
            .get(user_id)
            .map(|caps| caps.value().clone())
            .unwrap_or_default()
    }

    fn apply_update(&self, grants: HashMap<String, CapabilitySet>) {
        self.replace_all(grants);
    }
}
