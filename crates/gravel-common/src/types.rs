//! Core types shared across Gravel components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a cluster member, assigned on a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh random identifier (`node-<16 hex digits>`)
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        Self(format!("node-{:016x}", rng.random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Membership lifecycle of a node.
///
/// ```text
/// Unknown -> Joining -> Active <-> Unreachable -> Removed
///               |         |                        ^
///               v         +------------------------+
///            Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Record created, no join requested yet
    Unknown,
    /// Join accepted, waiting for the node to open its channel
    Joining,
    /// Channel open and heartbeating
    Active,
    /// Channel lost or silent past the heartbeat timeout
    Unreachable,
    /// Explicitly removed (terminal)
    Removed,
    /// Never confirmed its join (terminal)
    Rejected,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Unreachable => "unreachable",
            Self::Removed => "removed",
            Self::Rejected => "rejected",
        }
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::Rejected)
    }

    /// Joining and Active nodes hold an exclusive claim on their address
    pub fn holds_address(&self) -> bool {
        matches!(self, Self::Joining | Self::Active)
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the membership state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipEvent {
    RequestJoin,
    AuthOk,
    /// The node never confirmed its reservation
    AuthFail,
    HeartbeatTimeout,
    /// Transport-level close of an active channel
    ConnectionLost,
    Reconnect,
    ExplicitRemove,
}

impl MembershipEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestJoin => "request_join",
            Self::AuthOk => "auth_ok",
            Self::AuthFail => "auth_fail",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ConnectionLost => "connection_lost",
            Self::Reconnect => "reconnect",
            Self::ExplicitRemove => "explicit_remove",
        }
    }
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node's connection is being released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    /// No heartbeat within the configured interval
    Timeout,
    /// Transport closed or a send failed
    Close,
    /// Explicit removal from the cluster
    Removed,
}

impl DisconnectReason {
    /// Event applied to an active node for this reason
    pub fn event(&self) -> MembershipEvent {
        match self {
            Self::Timeout => MembershipEvent::HeartbeatTimeout,
            Self::Close => MembershipEvent::ConnectionLost,
            Self::Removed => MembershipEvent::ExplicitRemove,
        }
    }
}

/// Join token consumption policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPolicy {
    /// A token admits exactly one node
    SingleUse,
    /// A token admits any number of nodes until it expires
    MultiUse,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self::SingleUse
    }
}

impl TokenPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleUse => "single_use",
            Self::MultiUse => "multi_use",
        }
    }
}

impl fmt::Display for TokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TokenPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_use" | "single-use" => Ok(Self::SingleUse),
            "multi_use" | "multi-use" => Ok(Self::MultiUse),
            other => Err(format!("unknown token policy: {other}")),
        }
    }
}

/// Public view of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,

    /// Network location (host:port)
    pub address: String,

    pub state: NodeState,

    /// Join timestamp (Unix epoch seconds)
    pub joined_at: i64,

    /// Last heartbeat or message timestamp
    pub last_seen: i64,

    /// Whether a duplex channel is currently open
    pub connected: bool,
}
