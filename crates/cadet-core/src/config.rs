//! Core configuration

use std::time::Duration;
use serde::{Deserialize, Serialize};

/// What to evict when the relay buffer is full and a deeper rung exists
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RungEviction {
    /// Drop the head message of every direction in the deepest rung
    WholeRung,
    /// Drop the head message of a single direction in the deepest rung
    SingleDirection,
}

/// Core protocol configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum number of relay route entries
    pub max_routes: usize,

    /// Maximum number of messages buffered by the relay across all routes
    pub max_route_buffers: usize,

    /// Policy applied when the relay buffer is full
    pub rung_eviction: RungEviction,

    /// Maximum number of peers kept in the registry
    pub max_peers: usize,

    /// Maximum number of connections (sizes the per-connection queue)
    pub max_connections: usize,

    /// Maximum number of messages queued over all connections
    pub max_msgs_queue: usize,

    /// Connection keepalive period (routes expire after 3x, endpoints after 4x)
    pub keepalive_period: Duration,

    /// Base delay between CONNECTION_CREATE retransmissions
    pub create_connection_time: Duration,

    /// Upper bound for the poll back-off
    pub max_poll_time: Duration,

    /// How often the ephemeral key is replaced
    pub rekey_period: Duration,

    /// Initial TTL of encrypted messages
    pub default_ttl: u32,

    /// Old key generations kept for decryption while a KX is in progress
    pub old_key_generations: usize,

    /// Delay before an empty tunnel is destroyed
    pub tunnel_destroy_delay: Duration,

    /// Percentage of neighbor-bound messages dropped on purpose (testing only)
    pub drop_percent: u8,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_routes: 5000,
            max_route_buffers: 10_000,
            rung_eviction: RungEviction::WholeRung,
            max_peers: 1000,
            max_connections: 1000,
            max_msgs_queue: 10_000,
            keepalive_period: Duration::from_secs(60),
            create_connection_time: Duration::from_secs(1),
            max_poll_time: Duration::from_secs(600), // 10 minutes
            rekey_period: Duration::from_secs(86400), // 1 day
            default_ttl: 64,
            old_key_generations: 2,
            tunnel_destroy_delay: Duration::from_secs(60),
            drop_percent: 0,
        }
    }
}

impl CoreConfig {
    /// Create config for a relay-heavy node (many routes, deep buffers)
    pub fn relay() -> Self {
        Self {
            max_routes: 20_000,
            max_route_buffers: 50_000,
            ..Default::default()
        }
    }

    /// Create config for small in-process test networks
    pub fn testing() -> Self {
        Self {
            max_routes: 100,
            max_route_buffers: 64,
            max_peers: 64,
            max_connections: 16,
            max_msgs_queue: 256,
            rekey_period: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    /// Relay routes idle for this long are torn down
    pub fn route_linger(&self) -> Duration {
        self.keepalive_period * 3
    }

    /// Endpoint connections silent for this long are destroyed
    pub fn connection_timeout(&self) -> Duration {
        self.keepalive_period * 4
    }

    /// Per-direction queue limit of one connection
    pub fn connection_queue_max(&self) -> usize {
        self.max_msgs_queue / self.max_connections.max(1) + 1
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_routes == 0 {
            return Err("max_routes must be at least 1".into());
        }
        if self.max_peers < 2 {
            return Err("max_peers must be at least 2".into());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }
        if self.keepalive_period.is_zero() {
            return Err("keepalive_period must be non-zero".into());
        }
        if self.create_connection_time.is_zero() {
            return Err("create_connection_time must be non-zero".into());
        }
        if self.rekey_period < Duration::from_secs(16) {
            return Err(format!(
                "rekey_period {:?} is too short (min 16s)",
                self.rekey_period
            ));
        }
        if self.old_key_generations < 2 {
            return Err(format!(
                "old_key_generations must be at least 2, got {}",
                self.old_key_generations
            ));
        }
        if self.default_ttl == 0 {
            return Err("default_ttl must be at least 1".into());
        }
        if self.drop_percent > 100 {
            return Err(format!("drop_percent {} exceeds 100", self.drop_percent));
        }
        Ok(())
    }
}
