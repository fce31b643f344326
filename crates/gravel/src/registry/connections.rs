//! Live duplex channels, one per active node.
//!
//! Registering a channel is what confirms a join (Joining -> Active) or a
//! reconnect (Unreachable -> Active). Dropping a [`Connection`] drops its
//! channel, which the transport observes as the signal to close the socket.

use chrono::{DateTime, Utc};
use gravel_common::{
    DisconnectReason, ManagerMessage, MembershipEvent, NodeId, NodeState, RegisterError,
};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::channel::NodeChannel;
use crate::membership::MembershipTable;

/// Distinguishes successive channels of the same node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The live channel bound to an active node
pub struct Connection {
    pub node_id: NodeId,
    pub id: ConnectionId,
    pub opened_at: DateTime<Utc>,
    pub last_activity: Instant,
    channel: Box<dyn NodeChannel>,
}

/// Result of releasing a node's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// The node moved to `state`
    Released { state: NodeState },
    /// Nothing left to release
    AlreadyRemoved,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<NodeId, Connection>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a channel to a joining or unreachable node, making it Active
    pub fn register(
        &mut self,
        members: &mut MembershipTable,
        node_id: &NodeId,
        channel: Box<dyn NodeChannel>,
        now: Instant,
    ) -> Result<ConnectionId, RegisterError> {
        let node = members.get(node_id).ok_or(RegisterError::UnknownNode)?;
        let state = node.state;

        let event = match state {
            NodeState::Joining => MembershipEvent::AuthOk,
            NodeState::Unreachable => MembershipEvent::Reconnect,
            state => return Err(RegisterError::NotJoining { state }),
        };

        if let Some(holder) = members.holder_of(&node.address) {
            if &holder.id != node_id {
                tracing::warn!(
                    node = %node_id,
                    holder = %holder.id,
                    address = %holder.address,
                    "Reconnect refused, address taken by another member"
                );
                return Err(RegisterError::NotJoining { state });
            }
        }

        members
            .apply(node_id, event)
            .map_err(|e| RegisterError::NotJoining { state: e.from })?;
        members.touch(node_id, Utc::now());

        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(
            node_id.clone(),
            Connection {
                node_id: node_id.clone(),
                id,
                opened_at: Utc::now(),
                last_activity: now,
                channel,
            },
        );

        tracing::debug!(node = %node_id, connection = %id, event = %event, "Channel registered");

        Ok(id)
    }

    /// Release a node's connection and apply the matching transition.
    ///
    /// Idempotent: once released, further calls return `AlreadyRemoved`.
    pub fn unregister(
        &mut self,
        members: &mut MembershipTable,
        node_id: &NodeId,
        reason: DisconnectReason,
    ) -> UnregisterOutcome {
        self.release(members, node_id, None, reason)
    }

    /// Like [`unregister`](Self::unregister), but only if `connection_id` is
    /// still the node's current connection.
    pub fn disconnect(
        &mut self,
        members: &mut MembershipTable,
        node_id: &NodeId,
        connection_id: ConnectionId,
        reason: DisconnectReason,
    ) -> UnregisterOutcome {
        self.release(members, node_id, Some(connection_id), reason)
    }

    fn release(
        &mut self,
        members: &mut MembershipTable,
        node_id: &NodeId,
        expected: Option<ConnectionId>,
        reason: DisconnectReason,
    ) -> UnregisterOutcome {
        if let Some(expected) = expected {
            match self.connections.get(node_id) {
                Some(conn) if conn.id == expected => {}
                _ => {
                    tracing::debug!(node = %node_id, connection = %expected, "Stale disconnect ignored");
                    return UnregisterOutcome::AlreadyRemoved;
                }
            }
        }

        let Some(state) = members.state_of(node_id) else {
            return UnregisterOutcome::AlreadyRemoved;
        };

        let event = match (state, reason) {
            (NodeState::Active, reason) => reason.event(),
            (NodeState::Joining | NodeState::Unreachable, DisconnectReason::Removed) => {
                MembershipEvent::ExplicitRemove
            }
            _ => return UnregisterOutcome::AlreadyRemoved,
        };

        let connection = self.connections.remove(node_id);
        let outcome = match members.apply(node_id, event) {
            Ok(state) => UnregisterOutcome::Released { state },
            Err(_) => UnregisterOutcome::AlreadyRemoved,
        };

        if let Some(conn) = connection {
            tracing::debug!(
                node = %node_id,
                connection = %conn.id,
                reason = ?reason,
                open_secs = (Utc::now() - conn.opened_at).num_seconds(),
                "Channel released"
            );
        }

        outcome
    }

    /// Record activity on a node's channel.
    ///
    /// Returns false if the node has no open channel.
    pub fn heartbeat(&mut self, members: &mut MembershipTable, node_id: &NodeId, now: Instant) -> bool {
        match self.connections.get_mut(node_id) {
            Some(conn) => {
                conn.last_activity = now;
                members.touch(node_id, Utc::now());
                true
            }
            None => false,
        }
    }

    /// Nodes whose channel has been silent for longer than `timeout`
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        self.connections
            .values()
            .filter(|conn| now.saturating_duration_since(conn.last_activity) > timeout)
            .map(|conn| conn.node_id.clone())
            .collect()
    }

    /// Best-effort send to one node; a failed send closes its connection
    pub fn send(&mut self, members: &mut MembershipTable, node_id: &NodeId, message: &ManagerMessage) -> bool {
        let Some(conn) = self.connections.get(node_id) else {
            return false;
        };

        match conn.channel.deliver(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(node = %node_id, error = %e, "Send failed, dropping channel");
                self.unregister(members, node_id, DisconnectReason::Close);
                false
            }
        }
    }

    /// Best-effort send to every connected node, returning the delivery count
    pub fn broadcast(&mut self, members: &mut MembershipTable, message: &ManagerMessage) -> usize {
        let mut failed = Vec::new();
        let mut delivered = 0;

        for conn in self.connections.values() {
            match conn.channel.deliver(message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(node = %conn.node_id, error = %e, "Broadcast failed, dropping channel");
                    failed.push(conn.node_id.clone());
                }
            }
        }

        for node_id in failed {
            self.unregister(members, &node_id, DisconnectReason::Close);
        }

        delivered
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.connections.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
