//! Shared constants for Gravel components.

/// Default node manager HTTP/WebSocket listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1337";

/// Default join token validity (1 hour)
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Time an expired token keeps answering `Expired` before it is purged
pub const DEFAULT_TOKEN_RETAIN_EXPIRED_SECS: u64 = 3600;

/// Default scope stamped on issued join tokens
pub const DEFAULT_TOKEN_SCOPE: &str = "cluster";

/// Time a node has to open its channel after a successful join
pub const DEFAULT_JOIN_GRACE_SECS: u64 = 30;

/// Maximum time a join request waits for the membership lock
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 5;

/// Interval nodes are asked to send heartbeats at (seconds)
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Silence after which an active node is marked unreachable (seconds)
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 15;

/// Period of the background timeout sweep (seconds)
pub const SWEEP_INTERVAL_SECS: u64 = 1;

/// Outbound messages buffered per connection before it counts as stalled
pub const CHANNEL_BUFFER: usize = 64;

/// HTTP route paths
pub mod routes {
    /// Join request: POST {address, token}
    pub const JOIN: &str = "/nodes/join";

    /// Current join token
    pub const TOKEN: &str = "/nodes/token";

    /// Node duplex channel (WebSocket upgrade)
    pub const CHANNEL: &str = "/nodes/ws";
}
