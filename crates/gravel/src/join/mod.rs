//! Join handshake coordination.

mod address;
mod coordinator;

pub use coordinator::JoinCoordinator;
