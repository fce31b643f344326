//! Connection tracking for joined nodes.

mod channel;
mod connections;

pub use channel::NodeChannel;
pub use connections::{ConnectionId, ConnectionRegistry, UnregisterOutcome};
