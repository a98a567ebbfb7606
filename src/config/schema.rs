//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a cluster node.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for a cluster node.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Inbound connector (accept loop, admission, workers).
    pub connector: ConnectorConfig,

    /// Heartbeat-based membership.
    pub membership: MembershipConfig,

    /// Outbound reliable sender.
    pub sender: SenderConfig,

    /// Interceptors installed on the channel.
    pub interceptors: InterceptorConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Connector configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Bind address (e.g., "0.0.0.0:4000").
    pub bind_address: String,

    /// Listen backlog handed to the OS.
    pub backlog: u32,

    /// Maximum concurrently admitted connections.
    pub max_connections: usize,

    /// Number of long-lived worker tasks.
    pub worker_threads: usize,

    /// Pending work items the dispatch queue may hold before rejecting.
    pub queue_capacity: usize,

    /// Idle timeout applied to each connection, in milliseconds.
    pub connection_timeout_ms: u64,

    /// Requests served per connection before it is closed (None = unlimited).
    pub max_keep_alive_requests: Option<u32>,

    /// Interval of the parked-connection timeout scanner, in milliseconds.
    pub timeout_scan_interval_ms: u64,

    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_no_delay: bool,

    /// SO_LINGER in seconds (None leaves the OS default).
    pub so_linger_secs: Option<u64>,

    /// SO_RCVBUF on the listening socket (inherited by accepted sockets).
    pub recv_buffer_size: Option<u32>,

    /// SO_SNDBUF on the listening socket (inherited by accepted sockets).
    pub send_buffer_size: Option<u32>,

    /// SO_KEEPALIVE on the listening socket.
    pub keep_alive: bool,

    /// Base delay for accept error backoff in milliseconds.
    pub accept_backoff_base_ms: u64,

    /// Maximum delay for accept error backoff in milliseconds.
    pub accept_backoff_max_ms: u64,
}

impl ConnectorConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn timeout_scan_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_scan_interval_ms)
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4000".to_string(),
            backlog: 100,
            max_connections: 8_192,
            worker_threads: 16,
            queue_capacity: 1_024,
            connection_timeout_ms: 20_000,
            max_keep_alive_requests: None,
            timeout_scan_interval_ms: 1_000,
            tcp_no_delay: true,
            so_linger_secs: None,
            recv_buffer_size: None,
            send_buffer_size: None,
            keep_alive: true,
            accept_backoff_base_ms: 50,
            accept_backoff_max_ms: 1_600,
        }
    }
}

/// Membership configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MembershipConfig {
    /// UDP bind address for heartbeats.
    pub bind_address: String,

    /// Address advertised to peers (defaults to the connector's bind host).
    pub advertise_host: Option<String>,

    /// Heartbeat broadcast interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Silence after which a member is evicted, in milliseconds.
    pub expiration_ms: u64,

    /// Seed peers (UDP addresses) heartbeats are always sent to.
    pub peers: Vec<String>,

    /// Optional IPv4 multicast group to join and heartbeat to.
    pub multicast_group: Option<String>,

    /// TTL for multicast heartbeats.
    pub multicast_ttl: u32,

    /// Secure port advertised in the member record.
    pub secure_port: Option<u16>,

    /// Opaque payload advertised in the member record (UTF-8).
    pub payload: Option<String>,
}

impl MembershipConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:45564".to_string(),
            advertise_host: None,
            heartbeat_interval_ms: 1_000,
            expiration_ms: 3_000,
            peers: Vec::new(),
            multicast_group: None,
            multicast_ttl: 1,
            secure_port: None,
            payload: None,
        }
    }
}

/// Reliable sender configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SenderConfig {
    /// Upper bound on every ACK / ACK-after-processing wait, in milliseconds.
    pub ack_timeout_ms: u64,

    /// Connect timeout towards a destination, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Retries per faulty destination after the first attempt.
    pub max_retries: u32,

    /// Base delay between retry rounds in milliseconds.
    pub retry_base_delay_ms: u64,

    /// Maximum delay between retry rounds in milliseconds.
    pub retry_max_delay_ms: u64,

    /// Frames queued per destination before sends are rejected.
    pub queue_capacity: usize,

    /// Largest frame accepted or produced, in bytes.
    pub max_frame_bytes: usize,
}

impl SenderConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 3_000,
            connect_timeout_ms: 2_000,
            max_retries: 1,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1_000,
            queue_capacity: 256,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Interceptor selection.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Install the statistics interceptor.
    pub statistics: bool,

    /// Seconds between statistics reports.
    pub statistics_report_secs: u64,

    /// Install the compression interceptor.
    pub compression: bool,

    /// zstd compression level.
    pub compression_level: i32,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            statistics: true,
            statistics_report_secs: 60,
            compression: false,
            compression_level: 3,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format ("pretty" or "compact").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
