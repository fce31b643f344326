//! Node manager: the single entry point to cluster membership.
//!
//! All tables (nodes, tokens, connections, reservations) live behind one
//! mutex, and every mutating operation holds it for its full duration. After
//! each mutation the pending state changes are broadcast to connected nodes
//! and a fresh [`ClusterView`] is published on a watch channel, so read-only
//! queries never wait on writers.

use chrono::Utc;
use gravel_common::{
    DisconnectReason, JoinError, ManagerMessage, NodeId, NodeInfo, NodeState, RegisterError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{AppConfig, MembershipConfig, TokenConfig};
use crate::join::JoinCoordinator;
use crate::membership::{MembershipTable, StateChange};
use crate::registry::{ConnectionId, ConnectionRegistry, NodeChannel, UnregisterOutcome};
use crate::tokens::{Token, TokenAuthority};

/// Read-only snapshot of the cluster
#[derive(Clone, Debug, Default)]
pub struct ClusterView {
    /// Every recorded node, oldest first
    pub nodes: Vec<NodeInfo>,
    /// Current join token, if one is usable
    pub token: Option<String>,
    /// Open channels
    pub connections: usize,
}

impl ClusterView {
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }
}

/// What one sweep pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Reservations rejected after the grace period
    pub rejected: Vec<NodeId>,
    /// Active nodes marked unreachable after the heartbeat timeout
    pub timed_out: Vec<NodeId>,
    pub tokens_purged: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.rejected.is_empty() && self.timed_out.is_empty() && self.tokens_purged == 0
    }
}

struct Cluster {
    members: MembershipTable,
    tokens: TokenAuthority,
    registry: ConnectionRegistry,
    joins: JoinCoordinator,
    view_tx: watch::Sender<ClusterView>,
}

impl Cluster {
    /// Announce pending state changes, then publish a new snapshot.
    ///
    /// Broadcast failures unregister channels, which queues more changes;
    /// the loop ends because every failure removes a connection.
    fn settle(&mut self) {
        loop {
            let changes = self.members.take_changes();
            if changes.is_empty() {
                break;
            }

            for change in changes {
                log_change(&change);
                let message = ManagerMessage::Membership {
                    node_id: change.node_id,
                    address: change.address,
                    state: change.to,
                };
                self.registry.broadcast(&mut self.members, &message);
            }
        }

        self.publish();
    }

    fn publish(&self) {
        let mut nodes: Vec<NodeInfo> = self
            .members
            .iter()
            .map(|node| node.info(self.registry.is_connected(&node.id)))
            .collect();
        nodes.sort_by(|a, b| (a.joined_at, &a.node_id).cmp(&(b.joined_at, &b.node_id)));

        self.view_tx.send_replace(ClusterView {
            nodes,
            token: self.tokens.current().map(|t| t.value.clone()),
            connections: self.registry.len(),
        });
    }
}

fn log_change(change: &StateChange) {
    match change.to {
        NodeState::Unreachable => tracing::info!(
            node = %change.node_id,
            address = %change.address,
            event = %change.event,
            "Node unreachable"
        ),
        _ => tracing::info!(
            node = %change.node_id,
            address = %change.address,
            from = %change.from,
            to = %change.to,
            "Membership changed"
        ),
    }
}

/// Cluster membership facade shared by all transport handlers
#[derive(Clone)]
pub struct NodeManager {
    cluster: Arc<Mutex<Cluster>>,
    view: watch::Receiver<ClusterView>,
    bind_addr: Arc<str>,
    membership: MembershipConfig,
    token: TokenConfig,
}

impl NodeManager {
    pub fn new(config: &AppConfig) -> Self {
        let (view_tx, view) = watch::channel(ClusterView::default());

        let cluster = Cluster {
            members: MembershipTable::new(),
            tokens: TokenAuthority::new(config.token.policy),
            registry: ConnectionRegistry::new(),
            joins: JoinCoordinator::new(config.membership.join_grace()),
            view_tx,
        };

        Self {
            cluster: Arc::new(Mutex::new(cluster)),
            view,
            bind_addr: Arc::from(config.listen_addr.as_str()),
            membership: config.membership.clone(),
            token: config.token.clone(),
        }
    }

    #[cfg(test)]
    pub fn membership_config(&self) -> &MembershipConfig {
        &self.membership
    }

    // === Mutating operations ===

    /// Admit a node at `address` using a join token.
    ///
    /// The node stays Joining until it opens its channel.
    pub async fn join(&self, address: &str, token: &str) -> Result<NodeId, JoinError> {
        let mut cluster = tokio::time::timeout(self.membership.join_timeout(), self.cluster.lock())
            .await
            .map_err(|_| {
                tracing::warn!(address = %address, "Join timed out waiting for membership lock");
                JoinError::Timeout
            })?;

        let Cluster { members, tokens, joins, .. } = &mut *cluster;
        let result = joins.join(members, tokens, address, token, Instant::now());

        if let Err(ref e) = result {
            tracing::warn!(address = %address, code = e.code(), error = %e, "Join refused");
        }

        cluster.settle();
        result
    }

    /// Bind an opened channel to a joining (or reconnecting) node
    pub async fn register(
        &self,
        node_id: &NodeId,
        channel: Box<dyn NodeChannel>,
    ) -> Result<ConnectionId, RegisterError> {
        let mut cluster = self.cluster.lock().await;
        let Cluster { members, registry, joins, .. } = &mut *cluster;

        let result = registry.register(members, node_id, channel, Instant::now());
        match result {
            Ok(_) => {
                joins.clear(node_id);
                let welcome = ManagerMessage::Welcome {
                    node_id: node_id.clone(),
                    manager: self.bind_addr.to_string(),
                    heartbeat_interval_secs: self.membership.heartbeat_interval_secs,
                };
                registry.send(members, node_id, &welcome);
            }
            Err(ref e) => {
                tracing::warn!(node = %node_id, error = %e, "Channel registration refused");
            }
        }

        cluster.settle();
        result
    }

    /// Release a node's connection; idempotent
    pub async fn unregister(&self, node_id: &NodeId, reason: DisconnectReason) -> UnregisterOutcome {
        let mut cluster = self.cluster.lock().await;
        let Cluster { members, registry, joins, .. } = &mut *cluster;

        let outcome = registry.unregister(members, node_id, reason);
        if reason == DisconnectReason::Removed {
            joins.clear(node_id);
        }

        cluster.settle();
        outcome
    }

    /// Release `connection_id` if it is still the node's current channel
    pub async fn disconnect(
        &self,
        node_id: &NodeId,
        connection_id: ConnectionId,
        reason: DisconnectReason,
    ) -> UnregisterOutcome {
        let mut cluster = self.cluster.lock().await;
        let Cluster { members, registry, .. } = &mut *cluster;

        let outcome = registry.disconnect(members, node_id, connection_id, reason);

        cluster.settle();
        outcome
    }

    /// Explicitly remove a node; `None` if the node was never recorded
    pub async fn remove(&self, node_id: &NodeId) -> Option<UnregisterOutcome> {
        if self.node(node_id).is_none() {
            return None;
        }
        Some(self.unregister(node_id, DisconnectReason::Removed).await)
    }

    /// Record a heartbeat; false if the node has no open channel
    pub async fn heartbeat(&self, node_id: &NodeId) -> bool {
        let mut cluster = self.cluster.lock().await;
        let Cluster { members, registry, .. } = &mut *cluster;

        let alive = registry.heartbeat(members, node_id, Instant::now());
        if alive {
            // Keeps last_seen current in snapshot reads
            cluster.publish();
        }
        alive
    }

    /// Issue a join token, defaulting to the configured scope and TTL
    pub async fn issue_token(&self, scope: Option<&str>, ttl: Option<Duration>) -> Token {
        let mut cluster = self.cluster.lock().await;

        let token = cluster.tokens.generate(
            scope.unwrap_or(&self.token.scope),
            ttl.unwrap_or_else(|| self.token.ttl()),
        );
        tracing::info!(
            fingerprint = %token.fingerprint(),
            scope = %token.scope,
            expires_at = %token.expires_at,
            "Join token issued"
        );

        cluster.publish();
        token
    }

    /// Revoke the current token and issue a replacement
    pub async fn rotate_token(&self) -> Token {
        let mut cluster = self.cluster.lock().await;

        if let Some(previous) = cluster.tokens.current().map(|t| t.value.clone()) {
            cluster.tokens.revoke(&previous);
        }
        let token = cluster.tokens.generate(&self.token.scope, self.token.ttl());
        tracing::info!(fingerprint = %token.fingerprint(), "Join token rotated");

        cluster.publish();
        token
    }

    /// Revoke a token; false if it was never issued
    pub async fn revoke_token(&self, value: &str) -> bool {
        let mut cluster = self.cluster.lock().await;

        let known = cluster.tokens.revoke(value);
        cluster.publish();
        known
    }

    /// Drop Removed and Rejected node records
    pub async fn purge_retired(&self) -> usize {
        let mut cluster = self.cluster.lock().await;

        let purged = cluster.members.purge_retired();
        if purged > 0 {
            tracing::info!(purged, "Purged retired node records");
        }

        cluster.publish();
        purged
    }

    /// Expire reservations, time out silent channels, drop expired tokens
    pub async fn sweep(&self) -> SweepReport {
        let mut cluster = self.cluster.lock().await;
        let Cluster { members, tokens, registry, joins, .. } = &mut *cluster;
        let now = Instant::now();

        let rejected = joins.expire_reservations(members, now);

        let timed_out = registry.expired(now, self.membership.heartbeat_timeout());
        for node_id in &timed_out {
            registry.unregister(members, node_id, DisconnectReason::Timeout);
        }

        let tokens_purged = tokens.purge_expired(Utc::now(), self.token.retain_expired());

        cluster.settle();
        SweepReport {
            rejected,
            timed_out,
            tokens_purged,
        }
    }

    // === Snapshot reads ===

    pub fn view(&self) -> ClusterView {
        self.view.borrow().clone()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.view.borrow().nodes.clone()
    }

    pub fn node(&self, node_id: &NodeId) -> Option<NodeInfo> {
        self.view
            .borrow()
            .nodes
            .iter()
            .find(|n| &n.node_id == node_id)
            .cloned()
    }

    /// The current join token, if any is usable
    pub fn current_token(&self) -> Option<String> {
        self.view.borrow().token.clone()
    }

    // === Background tasks ===

    /// Periodic timeout sweep
    pub async fn run_sweeper(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.membership.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval = ?self.membership.sweep_interval(),
            heartbeat_timeout = ?self.membership.heartbeat_timeout(),
            join_grace = ?self.membership.join_grace(),
            "Membership sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        tracing::debug!(
                            rejected = report.rejected.len(),
                            timed_out = report.timed_out.len(),
                            tokens_purged = report.tokens_purged,
                            "Sweep pass"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Membership sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Replace the join token every `period`
    pub async fn run_rotation(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        tracing::info!(period = ?period, "Token rotation started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.rotate_token().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Token rotation shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gravel_common::{TokenError, TokenPolicy};
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn manager(policy: TokenPolicy) -> NodeManager {
        let mut config = AppConfig::default();
        config.token.policy = policy;
        NodeManager::new(&config)
    }

    fn channel() -> (Box<dyn NodeChannel>, mpsc::Receiver<ManagerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (Box::new(tx), rx)
    }

    fn state(manager: &NodeManager, node_id: &NodeId) -> Option<NodeState> {
        manager.node(node_id).map(|n| n.state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_heartbeat_timeout_and_reconnect() {
        let manager = manager(TokenPolicy::SingleUse);
        let token = manager.issue_token(None, Some(Duration::from_secs(60))).await;

        let n1 = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        assert_eq!(state(&manager, &n1), Some(NodeState::Joining));

        let (ch, mut rx) = channel();
        assert_ok!(manager.register(&n1, ch).await);
        assert_eq!(state(&manager, &n1), Some(NodeState::Active));
        assert!(matches!(rx.recv().await, Some(ManagerMessage::Welcome { .. })));

        let timeout = manager.membership_config().heartbeat_timeout();
        tokio::time::advance(timeout).await;
        assert!(manager.sweep().await.timed_out.is_empty());
        assert_eq!(state(&manager, &n1), Some(NodeState::Active));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(manager.sweep().await.timed_out, vec![n1.clone()]);
        assert_eq!(state(&manager, &n1), Some(NodeState::Unreachable));

        let (ch, _rx) = channel();
        assert_ok!(manager.register(&n1, ch).await);
        assert_eq!(state(&manager, &n1), Some(NodeState::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_defers_timeout() {
        let manager = manager(TokenPolicy::SingleUse);
        let token = manager.issue_token(None, None).await;
        let id = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        let (ch, _rx) = channel();
        manager.register(&id, ch).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            assert!(manager.heartbeat(&id).await);
            assert!(manager.sweep().await.timed_out.is_empty());
        }
        assert_eq!(state(&manager, &id), Some(NodeState::Active));
    }

    #[tokio::test]
    async fn test_bad_token_creates_no_node() {
        let manager = manager(TokenPolicy::SingleUse);

        assert_eq!(
            manager.join("10.0.0.1:1337", "bad-token").await,
            Err(JoinError::Token(TokenError::Unknown))
        );
        assert!(manager.nodes().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_yield_one_node() {
        let manager = manager(TokenPolicy::SingleUse);
        let token = manager.issue_token(None, None).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let token = token.value.clone();
            handles.push(tokio::spawn(async move {
                manager.join("10.0.0.1:1337", &token).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let (ch, _rx) = channel();
        manager.register(&ids[0], ch).await.unwrap();
        let view = manager.view();
        assert_eq!(view.nodes.len(), 1);
        assert_eq!(view.count(NodeState::Active), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_other_scopes() {
        let manager = manager(TokenPolicy::MultiUse);
        let first = manager.issue_token(Some("cluster"), None).await;
        let second = manager.issue_token(Some("storage"), None).await;

        let a = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.join("10.0.0.1:1337", &first.value).await })
        };
        let b = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.join("10.0.0.1:1337", &second.value).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(JoinError::AlreadyMember(_)))));
        assert_eq!(manager.nodes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_rejects_and_frees_address() {
        let manager = manager(TokenPolicy::MultiUse);
        let token = manager.issue_token(None, None).await;
        let id = manager.join("10.0.0.1:1337", &token.value).await.unwrap();

        tokio::time::advance(manager.membership_config().join_grace()).await;
        let report = manager.sweep().await;
        assert_eq!(report.rejected, vec![id.clone()]);
        assert_eq!(state(&manager, &id), Some(NodeState::Rejected));

        let (ch, _rx) = channel();
        assert_eq!(
            manager.register(&id, ch).await,
            Err(RegisterError::NotJoining { state: NodeState::Rejected })
        );

        let replacement = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        assert_ne!(replacement, id);
    }

    #[tokio::test]
    async fn test_unregister_twice_is_one_transition() {
        let manager = manager(TokenPolicy::SingleUse);
        let token = manager.issue_token(None, None).await;
        let id = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        let (ch, _rx) = channel();
        let conn = manager.register(&id, ch).await.unwrap();

        let first = manager.disconnect(&id, conn, DisconnectReason::Close).await;
        let second = manager.unregister(&id, DisconnectReason::Timeout).await;

        assert_eq!(first, UnregisterOutcome::Released { state: NodeState::Unreachable });
        assert_eq!(second, UnregisterOutcome::AlreadyRemoved);
    }

    #[tokio::test]
    async fn test_membership_changes_are_broadcast() {
        let manager = manager(TokenPolicy::MultiUse);
        let token = manager.issue_token(None, None).await;

        let a = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        let (ch, mut rx) = channel();
        manager.register(&a, ch).await.unwrap();

        let b = manager.join("10.0.0.2:1337", &token.value).await.unwrap();
        manager.remove(&b).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ManagerMessage::Membership { node_id, state, .. } = message {
                if node_id == b {
                    seen.push(state);
                }
            }
        }
        assert_eq!(seen, vec![NodeState::Joining, NodeState::Rejected]);
    }

    #[tokio::test]
    async fn test_expired_token_survives_sweep() {
        let manager = manager(TokenPolicy::SingleUse);
        let token = manager.issue_token(None, Some(Duration::ZERO)).await;

        assert_eq!(
            manager.join("10.0.0.1:1337", &token.value).await,
            Err(JoinError::Token(TokenError::Expired))
        );

        assert_eq!(manager.sweep().await.tokens_purged, 0);
        assert_eq!(
            manager.join("10.0.0.1:1337", &token.value).await,
            Err(JoinError::Token(TokenError::Expired))
        );
        assert!(manager.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_snapshot() {
        let manager = manager(TokenPolicy::SingleUse);
        let token = manager.issue_token(None, None).await;
        let id = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        let (ch, _rx) = channel();
        manager.register(&id, ch).await.unwrap();

        let mut view = manager.view.clone();
        view.borrow_and_update();
        assert!(manager.heartbeat(&id).await);
        assert!(view.has_changed().unwrap());

        view.borrow_and_update();
        assert!(!manager.heartbeat(&NodeId::from("node-missing")).await);
        assert!(!view.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_remove_unknown_node() {
        let manager = manager(TokenPolicy::SingleUse);
        assert!(manager.remove(&NodeId::from("node-missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_token_snapshot_and_rotation() {
        let manager = manager(TokenPolicy::SingleUse);
        assert_eq!(manager.current_token(), None);

        let first = manager.issue_token(None, None).await;
        assert_eq!(manager.current_token(), Some(first.value.clone()));

        let second = manager.rotate_token().await;
        assert_eq!(manager.current_token(), Some(second.value.clone()));
        assert_eq!(
            manager.join("10.0.0.1:1337", &first.value).await,
            Err(JoinError::Token(TokenError::AlreadyConsumed))
        );

        assert!(manager.revoke_token(&second.value).await);
        assert_eq!(manager.current_token(), None);
    }

    #[tokio::test]
    async fn test_purge_retired() {
        let manager = manager(TokenPolicy::MultiUse);
        let token = manager.issue_token(None, None).await;
        let id = manager.join("10.0.0.1:1337", &token.value).await.unwrap();
        manager.remove(&id).await;

        assert_eq!(state(&manager, &id), Some(NodeState::Rejected));
        assert_eq!(manager.purge_retired().await, 1);
        assert!(manager.nodes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_stops_on_shutdown() {
        let manager = manager(TokenPolicy::SingleUse);
        let (shutdown_tx, _) = broadcast::channel(1);

        let task = tokio::spawn(manager.clone().run_sweeper(shutdown_tx.subscribe()));
        tokio::time::advance(Duration::from_secs(3)).await;
        shutdown_tx.send(()).unwrap();

        assert_ok!(task.await);
    }
}
