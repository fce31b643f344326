//! Membership state machine.
//!
//! Implements:
//! - The transition table for node lifecycle events
//! - Node records with address lookups and a change log

mod machine;
mod table;

pub use table::{MembershipTable, StateChange};
