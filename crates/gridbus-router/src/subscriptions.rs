//! The broker's subscription table.
//!
//! A nested mapping `scope → bus → topic-prefix → subscriber set`. The table
//! is owned and mutated exclusively by the router's event loop, so it needs
//! no locking. The cleanup invariant — a prefix entry whose subscriber set
//! becomes empty is deleted, never kept as an empty placeholder — is
//! enforced here and nowhere else.

use gridbus_wire::pubsub::{Scope, SubscriptionSnapshot};
use std::collections::{HashMap, HashSet};

/// Prefix entries for one scope: `bus → prefix → subscribers`.
#[derive(Debug, Default)]
struct ScopeTable {
    buses: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl ScopeTable {
    fn insert(&mut self, bus: &str, prefix: &str, peer: &str) -> bool {
        self.buses
            .entry(bus.to_string())
            .or_default()
            .entry(prefix.to_string())
            .or_default()
            .insert(peer.to_string())
    }

    /// Remove one peer from one prefix, deleting emptied entries.
    fn remove(&mut self, bus: &str, prefix: &str, peer: &str) -> bool {
        let Some(prefixes) = self.buses.get_mut(bus) else {
            return false;
        };
        let Some(subscribers) = prefixes.get_mut(prefix) else {
            return false;
        };
        let removed = subscribers.remove(peer);
        if subscribers.is_empty() {
            prefixes.remove(prefix);
        }
        if prefixes.is_empty() {
            self.buses.remove(bus);
        }
        removed
    }

    /// Prefixes the peer subscribes to on `bus`.
    fn peer_prefixes(&self, bus: &str, peer: &str) -> Vec<String> {
        self.buses
            .get(bus)
            .map(|prefixes| {
                prefixes
                    .iter()
                    .filter(|(_, subscribers)| subscribers.contains(peer))
                    .map(|(prefix, _)| prefix.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every `(bus, prefix)` pair the peer subscribes to.
    fn peer_entries(&self, peer: &str) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        for (bus, prefixes) in &self.buses {
            for (prefix, subscribers) in prefixes {
                if subscribers.contains(peer) {
                    entries.push((bus.clone(), prefix.clone()));
                }
            }
        }
        entries
    }
}

/// The two-scope subscription table.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    internal: ScopeTable,
    all: ScopeTable,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, scope: Scope) -> &ScopeTable {
        match scope {
            Scope::Internal => &self.internal,
            Scope::All => &self.all,
        }
    }

    fn scope_mut(&mut self, scope: Scope) -> &mut ScopeTable {
        match scope {
            Scope::Internal => &mut self.internal,
            Scope::All => &mut self.all,
        }
    }

    /// Add a subscription. Returns true when the peer was not already
    /// subscribed to `(scope, bus, prefix)`.
    pub fn insert(&mut self, scope: Scope, bus: &str, prefix: &str, peer: &str) -> bool {
        self.scope_mut(scope).insert(bus, prefix, peer)
    }

    /// Remove one subscription.
    pub fn remove(&mut self, scope: Scope, bus: &str, prefix: &str, peer: &str) -> bool {
        self.scope_mut(scope).remove(bus, prefix, peer)
    }

    /// Drop a peer's subscriptions on `bus`: one prefix, or every prefix the
    /// peer holds when `prefix` is `None`. Spans both scopes. Returns the
    /// number of entries removed.
    pub fn remove_peer_bus(&mut self, peer: &str, bus: &str, prefix: Option<&str>) -> usize {
        let mut removed = 0;
        for scope in Scope::ALL_SCOPES {
            let prefixes = match prefix {
                Some(p) => vec![p.to_string()],
                None => self.scope(scope).peer_prefixes(bus, peer),
            };
            for p in prefixes {
                if self.scope_mut(scope).remove(bus, &p, peer) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Drop every subscription the peer holds, across scopes and buses.
    /// Returns the number of entries removed.
    pub fn drop_peer(&mut self, peer: &str) -> usize {
        let mut removed = 0;
        for scope in Scope::ALL_SCOPES {
            for (bus, prefix) in self.scope(scope).peer_entries(peer) {
                if self.scope_mut(scope).remove(&bus, &prefix, peer) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Subscribers of one scope whose prefix matches `topic` on `bus`.
    pub fn matching_in(&self, scope: Scope, bus: &str, topic: &str) -> HashSet<String> {
        let mut subscribers = HashSet::new();
        if let Some(prefixes) = self.scope(scope).buses.get(bus) {
            for (prefix, peers) in prefixes {
                if topic.starts_with(prefix.as_str()) {
                    subscribers.extend(peers.iter().cloned());
                }
            }
        }
        subscribers
    }

    /// Union of matching subscribers across both scopes.
    pub fn matching(&self, bus: &str, topic: &str) -> HashSet<String> {
        let mut subscribers = self.matching_in(Scope::Internal, bus, topic);
        subscribers.extend(self.matching_in(Scope::All, bus, topic));
        subscribers
    }

    /// Every stored `(prefix, subscribers)` pair on `bus`, across scopes.
    /// A prefix present in both scopes yields two entries.
    pub fn entries(&self, bus: &str) -> Vec<(Scope, String, HashSet<String>)> {
        let mut rows = Vec::new();
        for scope in Scope::ALL_SCOPES {
            if let Some(prefixes) = self.scope(scope).buses.get(bus) {
                for (prefix, peers) in prefixes {
                    rows.push((scope, prefix.clone(), peers.clone()));
                }
            }
        }
        rows
    }

    /// Every prefix stored in one scope, across buses.
    pub fn scope_prefixes(&self, scope: Scope) -> HashSet<String> {
        let mut prefixes = HashSet::new();
        for bus_prefixes in self.scope(scope).buses.values() {
            prefixes.extend(bus_prefixes.keys().cloned());
        }
        prefixes
    }

    /// The peer's complete subscription state.
    pub fn peer_snapshot(&self, peer: &str) -> SubscriptionSnapshot {
        let mut snapshot = SubscriptionSnapshot::default();
        for scope in Scope::ALL_SCOPES {
            for (bus, prefix) in self.scope(scope).peer_entries(peer) {
                snapshot.insert(scope, &bus, &prefix);
            }
        }
        snapshot
    }

    /// Reconcile the table with a peer's full snapshot: entries the peer
    /// holds that the snapshot omits are removed, entries the snapshot names
    /// that are missing are added. Applying the same snapshot twice is a
    /// no-op the second time. Returns `(added, removed)`.
    pub fn apply_snapshot(&mut self, peer: &str, snapshot: &SubscriptionSnapshot) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for scope in Scope::ALL_SCOPES {
            let wanted = snapshot.scope(scope);
            for (bus, prefix) in self.scope(scope).peer_entries(peer) {
                let keep = wanted
                    .get(&bus)
                    .map(|prefixes| prefixes.contains(&prefix))
                    .unwrap_or(false);
                if !keep && self.scope_mut(scope).remove(&bus, &prefix, peer) {
                    removed += 1;
                }
            }
            for (bus, prefixes) in wanted {
                for prefix in prefixes {
                    if self.scope_mut(scope).insert(bus, prefix, peer) {
                        added += 1;
                    }
                }
            }
        }
        (added, removed)
    }

    /// Total number of `(scope, bus, prefix, peer)` subscriptions.
    pub fn len(&self) -> usize {
        Scope::ALL_SCOPES
            .iter()
            .map(|scope| {
                self.scope(*scope)
                    .buses
                    .values()
                    .flat_map(|prefixes| prefixes.values())
                    .map(HashSet::len)
                    .sum::<usize>()
            })
            .sum()
    }

    /// True when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
