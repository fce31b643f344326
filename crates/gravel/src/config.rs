//! Configuration management for the node manager.

use anyhow::{Context, Result};
use gravel_common::TokenPolicy;
use gravel_common::constants::{
    CHANNEL_BUFFER, DEFAULT_JOIN_GRACE_SECS, DEFAULT_JOIN_TIMEOUT_SECS, DEFAULT_LISTEN_ADDR,
    DEFAULT_TOKEN_RETAIN_EXPIRED_SECS, DEFAULT_TOKEN_SCOPE, DEFAULT_TOKEN_TTL_SECS, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS,
    SWEEP_INTERVAL_SECS,
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP/WebSocket listen address, also announced to nodes
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Membership timing configuration
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Join token configuration
    #[serde(default)]
    pub token: TokenConfig,
}

/// Membership timings
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    /// Seconds a joined node has to open its channel
    #[serde(default = "default_join_grace")]
    pub join_grace_secs: u64,

    /// Seconds a join request may wait for the membership lock
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    /// Heartbeat interval announced to nodes
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Silence after which an active node becomes unreachable
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Period of the timeout sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Outbound messages buffered per node channel
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

impl MembershipConfig {
    pub fn join_grace(&self) -> Duration {
        Duration::from_secs(self.join_grace_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn channel_buffer(&self) -> usize {
        // tokio's mpsc refuses a zero capacity
        self.channel_buffer.max(1)
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            join_grace_secs: default_join_grace(),
            join_timeout_secs: default_join_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

/// Join token issuance
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Single-use or multi-use tokens
    #[serde(default)]
    pub policy: TokenPolicy,

    /// Token validity in seconds
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u64,

    /// Seconds an expired token is kept so joins still report it as expired
    #[serde(default = "default_token_retain_expired")]
    pub retain_expired_secs: u64,

    /// Scope stamped on issued tokens
    #[serde(default = "default_token_scope")]
    pub scope: String,

    /// Replace the current token on this schedule (disabled if unset)
    #[serde(default)]
    pub rotate_interval_secs: Option<u64>,

    /// Issue a token at startup
    #[serde(default = "default_issue_on_start")]
    pub issue_on_start: bool,
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn retain_expired(&self) -> Duration {
        Duration::from_secs(self.retain_expired_secs)
    }

    pub fn rotate_interval(&self) -> Option<Duration> {
        self.rotate_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            policy: TokenPolicy::default(),
            ttl_secs: default_token_ttl(),
            retain_expired_secs: default_token_retain_expired(),
            scope: default_token_scope(),
            rotate_interval_secs: None,
            issue_on_start: default_issue_on_start(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_join_grace() -> u64 { DEFAULT_JOIN_GRACE_SECS }
fn default_join_timeout() -> u64 { DEFAULT_JOIN_TIMEOUT_SECS }
fn default_heartbeat_interval() -> u64 { HEARTBEAT_INTERVAL_SECS }
fn default_heartbeat_timeout() -> u64 { HEARTBEAT_TIMEOUT_SECS }
fn default_sweep_interval() -> u64 { SWEEP_INTERVAL_SECS }
fn default_channel_buffer() -> usize { CHANNEL_BUFFER }
fn default_token_ttl() -> u64 { DEFAULT_TOKEN_TTL_SECS } // 1 hour
fn default_token_retain_expired() -> u64 { DEFAULT_TOKEN_RETAIN_EXPIRED_SECS }
fn default_token_scope() -> String { DEFAULT_TOKEN_SCOPE.to_string() }
fn default_issue_on_start() -> bool { true }

impl AppConfig {
    /// Load configuration from file and `GRAVEL__*` environment, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        if !Path::new(config_path).exists() {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("GRAVEL").separator("__"))
            .build()
            .context("Failed to load config file")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(policy) = args.token_policy {
            config.token.policy = policy;
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            membership: MembershipConfig::default(),
            token: TokenConfig::default(),
        }
    }
}
