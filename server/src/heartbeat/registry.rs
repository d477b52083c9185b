//! Gateway liveness and topology-change tracking.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::models::{NewNode, NodeRecord};

/// What a heartbeat asks the listener to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Sequence did not advance; only liveness was refreshed.
    Unchanged,
    /// First accepted sequence of a gateway: insert everything and push reference files.
    Bootstrap { previous: u16 },
    /// A known gateway's topology changed: reconcile its nodes.
    Reconcile { previous: u16 },
}

#[derive(Debug, Clone)]
struct GatewayState {
    sequence: u16,
    last_seen: Instant,
    /// Set until the first sync of this gateway succeeds.
    is_new: bool,
}

/// Known gateways, keyed by device id. Owned by the heartbeat loop.
#[derive(Debug)]
pub struct GatewayRegistry {
    gateways: HashMap<String, GatewayState>,
    timeout: Duration,
}

impl GatewayRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            gateways: HashMap::new(),
            timeout,
        }
    }

    /// Record a heartbeat. The stored sequence only moves forward.
    pub fn observe(&mut self, id: &str, sequence: u16, now: Instant) -> HeartbeatOutcome {
        let state = self
            .gateways
            .entry(id.to_string())
            .or_insert_with(|| GatewayState {
                sequence: 0,
                last_seen: now,
                is_new: true,
            });

        let outcome = if sequence > state.sequence {
            let previous = state.sequence;
            state.sequence = sequence;
            if state.is_new {
                HeartbeatOutcome::Bootstrap { previous }
            } else {
                HeartbeatOutcome::Reconcile { previous }
            }
        } else {
            HeartbeatOutcome::Unchanged
        };

        state.last_seen = now;
        outcome
    }

    /// Mark the sync triggered by the last heartbeat as done.
    pub fn commit(&mut self, id: &str) {
        if let Some(state) = self.gateways.get_mut(id) {
            state.is_new = false;
        }
    }

    /// Undo an accepted sequence so the next heartbeat retries the sync.
    pub fn rollback(&mut self, id: &str, previous: u16) {
        if let Some(state) = self.gateways.get_mut(id) {
            state.sequence = previous;
        }
    }

    /// Evict every gateway silent for longer than the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let mut evicted = Vec::new();
        self.gateways.retain(|id, state| {
            let alive = now.saturating_duration_since(state.last_seen) <= timeout;
            if !alive {
                evicted.push(id.clone());
            }
            alive
        });
        evicted.sort();
        evicted
    }

    pub fn sequence(&self, id: &str) -> Option<u16> {
        self.gateways.get(id).map(|s| s.sequence)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.gateways.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.gateways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

/// Node changes that bring storage in line with a fresh descriptor.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NodeDiff {
    pub to_insert: Vec<NewNode>,
    /// Local ids of nodes that are gone.
    pub to_delete: Vec<String>,
}

impl NodeDiff {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_delete.is_empty()
    }
}

/// Set difference on local ids. Nodes present on both sides are left out.
pub fn diff_nodes(existing: &[NodeRecord], incoming: &[NewNode]) -> NodeDiff {
    let old: BTreeSet<&str> = existing.iter().map(|n| n.local_id.as_str()).collect();
    let new: BTreeSet<&str> = incoming.iter().map(|n| n.local_id.as_str()).collect();

    NodeDiff {
        to_insert: incoming
            .iter()
            .filter(|n| !old.contains(n.local_id.as_str()))
            .cloned()
            .collect(),
        to_delete: old.difference(&new).map(|id| id.to_string()).collect(),
    }
}
