//! Membership transition table.

use gravel_common::{InvalidTransition, MembershipEvent, NodeState};

/// Compute the state `event` moves a node in `from` to.
///
/// Removed and Rejected are terminal: every event fails from them.
pub fn transition(from: NodeState, event: MembershipEvent) -> Result<NodeState, InvalidTransition> {
    use MembershipEvent::*;
    use NodeState::*;

    let to = match (from, event) {
        (Unknown, RequestJoin) => Joining,
        (Joining, AuthOk) => Active,
        (Joining, AuthFail | ExplicitRemove) => Rejected,
        (Active, HeartbeatTimeout | ConnectionLost) => Unreachable,
        (Unreachable, Reconnect) => Active,
        (Active | Unreachable, ExplicitRemove) => Removed,
        _ => return Err(InvalidTransition { from, event }),
    };

    Ok(to)
}
