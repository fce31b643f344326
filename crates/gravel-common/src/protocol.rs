//! Duplex channel protocol between the node manager and joined nodes.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! ```text
//! node    -> manager : {"type":"hello","node_id":"node-..."}   (must be first)
//!                      {"type":"heartbeat"}
//!                      {"type":"leave"}
//! manager -> node    : {"type":"welcome",...}
//!                      {"type":"membership",...}
//!                      {"type":"rejected","code":...,"reason":...}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, NodeState};

/// Messages sent by a node over its channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// Join confirmation carrying the id returned by the join call
    Hello { node_id: NodeId },
    Heartbeat,
    /// Leave the cluster for good
    Leave,
}

impl NodeMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages sent by the manager to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    /// Channel accepted; the node is now active
    Welcome {
        node_id: NodeId,
        /// Address the manager is bound to
        manager: String,
        heartbeat_interval_secs: u64,
    },
    /// A member changed state
    Membership {
        node_id: NodeId,
        address: String,
        state: NodeState,
    },
    /// Channel refused; the connection is closed after this message
    Rejected { code: String, reason: String },
}

impl ManagerMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
