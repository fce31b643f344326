//! Two-phase join: reserve the address with a token, then confirm by opening the
//! channel within the grace period.

use gravel_common::{JoinError, MembershipEvent, NodeId, NodeState, TokenError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::address::normalize_address;
use crate::membership::MembershipTable;
use crate::tokens::{TokenAuthority, fingerprint};

/// Join handshake orchestration and reservation bookkeeping
pub struct JoinCoordinator {
    /// Time a reservation waits for its channel
    grace: Duration,
    /// Grace deadline per Joining node
    reservations: HashMap<NodeId, Instant>,
}

impl JoinCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            reservations: HashMap::new(),
        }
    }

    /// Reserve `address` for a new node authenticated by `token`.
    ///
    /// Repeating a join for an address already held under the same token
    /// scope returns the existing node instead of failing.
    pub fn join(
        &mut self,
        members: &mut MembershipTable,
        tokens: &mut TokenAuthority,
        address: &str,
        token: &str,
        now: Instant,
    ) -> Result<NodeId, JoinError> {
        let address = normalize_address(address)?;
        let inspected = tokens.inspect(token);
        let admitted_by = fingerprint(token);

        match (&inspected, members.holder_of(&address)) {
            (Err(TokenError::Unknown | TokenError::Expired), _) => {}
            (Err(TokenError::AlreadyConsumed), Some(holder)) if holder.admitted_by == admitted_by => {
                tracing::debug!(node = %holder.id, address = %address, "Repeated join with spent token");
                return Ok(holder.id.clone());
            }
            (Ok(scope), Some(holder)) if holder.scope == scope.scope => {
                tracing::debug!(
                    node = %holder.id,
                    address = %address,
                    state = %holder.state,
                    "Repeated join, returning existing node"
                );
                return Ok(holder.id.clone());
            }
            (Ok(_), Some(_)) => return Err(JoinError::AlreadyMember(address)),
            _ => {}
        }
        inspected?;

        let scope = tokens.validate(token)?;

        for stale in members.at_address(&address, NodeState::Unreachable) {
            match members.apply(&stale, MembershipEvent::ExplicitRemove) {
                Ok(_) => tracing::info!(node = %stale, address = %address, "Unreachable node superseded by new join"),
                Err(e) => tracing::debug!(node = %stale, error = %e, "Unreachable node not superseded"),
            }
        }

        let node_id = members.insert(&address, &scope.scope, &admitted_by);
        members.apply(&node_id, MembershipEvent::RequestJoin)?;
        self.reservations.insert(node_id.clone(), now + self.grace);

        tracing::info!(
            node = %node_id,
            address = %address,
            scope = %scope.scope,
            grace_secs = self.grace.as_secs(),
            "Join reserved"
        );

        Ok(node_id)
    }

    /// Drop the reservation of a node whose channel is now open
    pub fn clear(&mut self, node_id: &NodeId) {
        self.reservations.remove(node_id);
    }

    /// Reject every node still Joining past its grace deadline
    pub fn expire_reservations(&mut self, members: &mut MembershipTable, now: Instant) -> Vec<NodeId> {
        let overdue: Vec<NodeId> = self
            .reservations
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(id, _)| id.clone())
            .collect();

        let mut rejected = Vec::new();
        for node_id in overdue {
            self.reservations.remove(&node_id);

            if members.state_of(&node_id) != Some(NodeState::Joining) {
                continue;
            }
            if members.apply(&node_id, MembershipEvent::AuthFail).is_ok() {
                tracing::info!(node = %node_id, "Join grace period elapsed, reservation rejected");
                rejected.push(node_id);
            }
        }

        rejected
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.reservations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gravel_common::TokenPolicy;
    use tokio_test::assert_ok;

    const GRACE: Duration = Duration::from_secs(30);
    const TTL: Duration = Duration::from_secs(60);

    struct Fixture {
        members: MembershipTable,
        tokens: TokenAuthority,
        joins: JoinCoordinator,
    }

    impl Fixture {
        fn new(policy: TokenPolicy) -> Self {
            Self {
                members: MembershipTable::new(),
                tokens: TokenAuthority::new(policy),
                joins: JoinCoordinator::new(GRACE),
            }
        }

        fn join(&mut self, address: &str, token: &str, now: Instant) -> Result<NodeId, JoinError> {
            self.joins
                .join(&mut self.members, &mut self.tokens, address, token, now)
        }
    }

    #[test]
    fn test_join_reserves_address() {
        let mut fx = Fixture::new(TokenPolicy::SingleUse);
        let token = fx.tokens.generate("cluster", TTL);

        let id = assert_ok!(fx.join("10.0.0.1:1337", &token.value, Instant::now()));
        assert_eq!(fx.members.state_of(&id), Some(NodeState::Joining));
        assert_eq!(fx.joins.pending(), 1);
        assert!(fx.tokens.current().is_none());
    }

    #[test]
    fn test_bad_token_creates_nothing() {
        let mut fx = Fixture::new(TokenPolicy::SingleUse);

        assert_eq!(
            fx.join("10.0.0.1:1337", "bad-token", Instant::now()),
            Err(JoinError::Token(TokenError::Unknown))
        );
        assert_eq!(fx.members.len(), 0);
    }

    #[test]
    fn test_invalid_address_checked_first() {
        let mut fx = Fixture::new(TokenPolicy::SingleUse);
        let token = fx.tokens.generate("cluster", TTL);

        assert!(matches!(
            fx.join("10.0.0.1", &token.value, Instant::now()),
            Err(JoinError::InvalidAddress(_))
        ));
        assert_ok!(fx.tokens.inspect(&token.value));
    }

    #[test]
    fn test_repeated_join_is_idempotent() {
        let mut fx = Fixture::new(TokenPolicy::SingleUse);
        let token = fx.tokens.generate("cluster", TTL);
        let now = Instant::now();

        let first = fx.join("10.0.0.1:1337", &token.value, now).unwrap();
        // The single-use token is spent, so the retry goes through a fresh one
        let retry = fx.tokens.generate("cluster", TTL);
        let second = fx.join("10.0.0.1:1337", &retry.value, now).unwrap();

        assert_eq!(first, second);
        assert_eq!(fx.members.len(), 1);
        assert_ok!(fx.tokens.inspect(&retry.value));
    }

    #[test]
    fn test_repeated_join_with_spent_token() {
        let mut fx = Fixture::new(TokenPolicy::SingleUse);
        let token = fx.tokens.generate("cluster", TTL);
        let now = Instant::now();

        let first = fx.join("10.0.0.1:1337", &token.value, now).unwrap();
        assert_eq!(fx.join("10.0.0.1:1337", &token.value, now), Ok(first));

        assert_eq!(
            fx.join("10.0.0.2:1337", &token.value, now),
            Err(JoinError::Token(TokenError::AlreadyConsumed))
        );
        assert_eq!(fx.members.len(), 1);
    }

    #[test]
    fn test_other_scope_is_already_member() {
        let mut fx = Fixture::new(TokenPolicy::MultiUse);
        let token = fx.tokens.generate("cluster", TTL);
        let other = fx.tokens.generate("storage", TTL);
        let now = Instant::now();

        fx.join("10.0.0.1:1337", &token.value, now).unwrap();
        assert_eq!(
            fx.join("10.0.0.1:1337", &other.value, now),
            Err(JoinError::AlreadyMember("10.0.0.1:1337".to_string()))
        );
    }

    #[test]
    fn test_grace_expiry_frees_address() {
        let mut fx = Fixture::new(TokenPolicy::MultiUse);
        let token = fx.tokens.generate("cluster", TTL);
        let start = Instant::now();

        let id = fx.join("10.0.0.1:1337", &token.value, start).unwrap();

        assert!(fx.joins.expire_reservations(&mut fx.members, start + GRACE - Duration::from_millis(1)).is_empty());
        assert_eq!(fx.joins.expire_reservations(&mut fx.members, start + GRACE), vec![id.clone()]);
        assert_eq!(fx.members.state_of(&id), Some(NodeState::Rejected));
        assert!(fx.members.holder_of("10.0.0.1:1337").is_none());

        let again = fx.join("10.0.0.1:1337", &token.value, start + GRACE).unwrap();
        assert_ne!(again, id);
    }

    #[test]
    fn test_cleared_reservation_never_expires() {
        let mut fx = Fixture::new(TokenPolicy::SingleUse);
        let token = fx.tokens.generate("cluster", TTL);
        let start = Instant::now();

        let id = fx.join("10.0.0.1:1337", &token.value, start).unwrap();
        fx.members.apply(&id, MembershipEvent::AuthOk).unwrap();
        fx.joins.clear(&id);

        assert!(fx.joins.expire_reservations(&mut fx.members, start + GRACE * 2).is_empty());
        assert_eq!(fx.members.state_of(&id), Some(NodeState::Active));
    }

    #[test]
    fn test_join_supersedes_unreachable_node() {
        let mut fx = Fixture::new(TokenPolicy::MultiUse);
        let token = fx.tokens.generate("cluster", TTL);
        let now = Instant::now();

        let old = fx.join("10.0.0.1:1337", &token.value, now).unwrap();
        fx.members.apply(&old, MembershipEvent::AuthOk).unwrap();
        fx.members.apply(&old, MembershipEvent::HeartbeatTimeout).unwrap();

        let new = fx.join("10.0.0.1:1337", &token.value, now).unwrap();
        assert_ne!(old, new);
        assert_eq!(fx.members.state_of(&old), Some(NodeState::Removed));
        assert_eq!(fx.members.state_of(&new), Some(NodeState::Joining));
    }
}
