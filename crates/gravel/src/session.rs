//! Per-connection protocol handling, independent of the transport.

use async_trait::async_trait;
use gravel_common::{DisconnectReason, ManagerMessage, NodeId, NodeMessage, NodeState, RegisterError};
use tokio::sync::mpsc;

use crate::manager::NodeManager;
use crate::registry::ConnectionId;

/// Whether the transport should keep reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Reacts to frames arriving on a node's duplex channel
#[async_trait]
pub trait ConnectionHandler: Send {
    async fn on_message(&mut self, message: NodeMessage) -> Flow;

    /// Called once the transport is gone, whatever the cause
    async fn on_close(&mut self);
}

/// Session of one node channel against the [`NodeManager`].
///
/// The outbound sender is handed to the registry on `hello`; afterwards the
/// registry holds the only copy, so dropping the connection there closes
/// the transport.
pub struct NodeSession {
    manager: NodeManager,
    outbound: Option<mpsc::Sender<ManagerMessage>>,
    bound: Option<(NodeId, ConnectionId)>,
    closed: bool,
}

impl NodeSession {
    pub fn new(manager: NodeManager, outbound: mpsc::Sender<ManagerMessage>) -> Self {
        Self {
            manager,
            outbound: Some(outbound),
            bound: None,
            closed: false,
        }
    }

    #[cfg(test)]
    pub fn node_id(&self) -> Option<&NodeId> {
        self.bound.as_ref().map(|(id, _)| id)
    }

    async fn hello(&mut self, node_id: NodeId) -> Flow {
        let Some(outbound) = self.outbound.take() else {
            return Flow::Close;
        };

        match self.manager.register(&node_id, Box::new(outbound.clone())).await {
            Ok(connection_id) => {
                tracing::info!(node = %node_id, connection = %connection_id, "Node channel open");
                self.bound = Some((node_id, connection_id));
                Flow::Continue
            }
            Err(e) => {
                reject(&outbound, register_code(&e), e.to_string()).await;
                Flow::Close
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for NodeSession {
    async fn on_message(&mut self, message: NodeMessage) -> Flow {
        let bound = self.bound.clone();

        match (message, bound) {
            (NodeMessage::Hello { node_id }, None) => self.hello(node_id).await,
            (NodeMessage::Hello { node_id }, Some((current, _))) => {
                tracing::debug!(node = %current, hello = %node_id, "Duplicate hello ignored");
                Flow::Continue
            }
            (_, None) => {
                if let Some(outbound) = self.outbound.take() {
                    reject(&outbound, "hello_required", "first message must be hello".into()).await;
                }
                Flow::Close
            }
            (NodeMessage::Heartbeat, Some((node_id, _))) => {
                if self.manager.heartbeat(&node_id).await {
                    Flow::Continue
                } else {
                    // Timed out or removed while the socket stayed open
                    Flow::Close
                }
            }
            (NodeMessage::Leave, Some((node_id, _))) => {
                tracing::info!(node = %node_id, "Node leaving");
                self.manager.remove(&node_id).await;
                Flow::Close
            }
        }
    }

    async fn on_close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        self.outbound = None;

        if let Some((node_id, connection_id)) = self.bound.clone() {
            self.manager
                .disconnect(&node_id, connection_id, DisconnectReason::Close)
                .await;
            tracing::debug!(node = %node_id, connection = %connection_id, "Session closed");
        }
    }
}

fn register_code(error: &RegisterError) -> &'static str {
    match error {
        // Reservation lapsed before the channel opened
        RegisterError::NotJoining { state: NodeState::Rejected } => "timeout",
        RegisterError::NotJoining { .. } => "not_joining",
        RegisterError::UnknownNode => "unknown_node",
    }
}

async fn reject(outbound: &mpsc::Sender<ManagerMessage>, code: &str, reason: String) {
    tracing::warn!(code = %code, reason = %reason, "Node channel rejected");

    let message = ManagerMessage::Rejected {
        code: code.to_string(),
        reason,
    };
    // The peer may already be gone
    let _ = outbound.send(message).await;
}
