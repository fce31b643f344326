//! Per-node membership records.

use chrono::{DateTime, Utc};
use gravel_common::{InvalidTransition, MembershipEvent, NodeId, NodeInfo, NodeState};
use std::collections::HashMap;

use super::machine::transition;

/// A cluster member as tracked by the manager
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    /// Normalized host:port
    pub address: String,
    /// Scope of the token that admitted this node
    pub scope: String,
    /// Fingerprint of the token that admitted this node
    pub admitted_by: String,
    pub state: NodeState,
    pub joined_at: DateTime<Utc>,
    /// Last heartbeat or message
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn info(&self, connected: bool) -> NodeInfo {
        NodeInfo {
            node_id: self.id.clone(),
            address: self.address.clone(),
            state: self.state,
            joined_at: self.joined_at.timestamp(),
            last_seen: self.last_seen.timestamp(),
            connected,
        }
    }
}

/// A transition that was applied
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub node_id: NodeId,
    pub address: String,
    pub from: NodeState,
    pub to: NodeState,
    pub event: MembershipEvent,
}

/// Node records plus the log of transitions not yet announced
#[derive(Default)]
pub struct MembershipTable {
    nodes: HashMap<NodeId, Node>,
    changes: Vec<StateChange>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new node in the Unknown state
    pub fn insert(&mut self, address: &str, scope: &str, admitted_by: &str) -> NodeId {
        let mut id = NodeId::generate();
        while self.nodes.contains_key(&id) {
            id = NodeId::generate();
        }

        let now = Utc::now();
        self.nodes.insert(
            id.clone(),
            Node {
                id: id.clone(),
                address: address.to_string(),
                scope: scope.to_string(),
                admitted_by: admitted_by.to_string(),
                state: NodeState::Unknown,
                joined_at: now,
                last_seen: now,
            },
        );

        id
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.nodes.get(id).map(|node| node.state)
    }

    /// Apply `event` to a node.
    ///
    /// A node without a record counts as Unknown. Invalid transitions leave
    /// the record untouched and are logged.
    pub fn apply(&mut self, id: &NodeId, event: MembershipEvent) -> Result<NodeState, InvalidTransition> {
        let Some(node) = self.nodes.get_mut(id) else {
            let err = InvalidTransition { from: NodeState::Unknown, event };
            tracing::error!(node = %id, error = %err, "Transition for unrecorded node");
            return Err(err);
        };

        let from = node.state;
        match transition(from, event) {
            Ok(to) => {
                node.state = to;
                self.changes.push(StateChange {
                    node_id: node.id.clone(),
                    address: node.address.clone(),
                    from,
                    to,
                    event,
                });
                Ok(to)
            }
            Err(err) => {
                tracing::error!(
                    node = %id,
                    address = %node.address,
                    error = %err,
                    "Rejected invalid membership transition"
                );
                Err(err)
            }
        }
    }

    /// Update a node's last-seen timestamp
    pub fn touch(&mut self, id: &NodeId, now: DateTime<Utc>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.last_seen = now;
        }
    }

    /// The Joining or Active node holding `address`, if any
    pub fn holder_of(&self, address: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|node| node.address == address && node.state.holds_address())
    }

    /// Nodes at `address` in the given state
    pub fn at_address(&self, address: &str, state: NodeState) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.address == address && node.state == state)
            .map(|node| node.id.clone())
            .collect()
    }

    /// Drain the transitions applied since the last call
    pub fn take_changes(&mut self) -> Vec<StateChange> {
        std::mem::take(&mut self.changes)
    }

    /// Delete Removed and Rejected records
    pub fn purge_retired(&mut self) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| !node.state.is_terminal());
        before - self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    #[cfg(test)]
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|node| node.state == state).count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
