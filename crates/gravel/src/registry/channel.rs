//! Outbound half of a node's duplex channel, independent of the transport.

use gravel_common::ManagerMessage;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    /// The peer is not draining its messages
    #[error("channel full")]
    Full,
}

/// Capability to push a message to a connected node without blocking
pub trait NodeChannel: Send + Sync {
    fn deliver(&self, message: &ManagerMessage) -> Result<(), ChannelError>;
}

impl NodeChannel for mpsc::Sender<ManagerMessage> {
    fn deliver(&self, message: &ManagerMessage) -> Result<(), ChannelError> {
        self.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Full,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpsc_channel_errors() {
        let msg = ManagerMessage::Rejected {
            code: "test".into(),
            reason: "test".into(),
        };

        let (tx, mut rx) = mpsc::channel(1);
        assert_eq!(tx.deliver(&msg), Ok(()));
        assert_eq!(tx.deliver(&msg), Err(ChannelError::Full));
        assert_eq!(rx.try_recv().ok(), Some(msg.clone()));

        drop(rx);
        assert_eq!(tx.deliver(&msg), Err(ChannelError::Closed));
    }
}
