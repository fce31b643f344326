//! # Gravel Common
//!
//! Shared types, wire protocol, and errors used across Gravel components.
//!
//! ## Modules
//! - `types` - Core data structures (NodeId, NodeState, NodeInfo, etc.)
//! - `protocol` - Messages exchanged over a node's duplex channel
//! - `error` - Join, token, and registration errors
//! - `constants` - Shared configuration constants

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{InvalidTransition, JoinError, RegisterError, TokenError};
pub use protocol::{ManagerMessage, NodeMessage};
pub use types::*;
