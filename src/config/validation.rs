//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, pools non-empty)
//! - Validate addresses parse before any socket is bound
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NodeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

use crate::config::schema::NodeConfig;
use crate::membership::MAX_MEMBER_PAYLOAD;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field}: must be greater than zero")]
    Zero { field: &'static str },

    #[error("membership.heartbeat_interval_ms ({interval}) must be below membership.expiration_ms ({expiration})")]
    HeartbeatTooSlow { interval: u64, expiration: u64 },

    #[error("membership.multicast_group: {0:?} is not an IPv4 multicast address")]
    NotMulticast(String),

    #[error("connector.accept_backoff_base_ms must not exceed accept_backoff_max_ms")]
    BackoffRange,

    #[error("membership.payload: {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("observability.log_format: unknown format {0:?}")]
    LogFormat(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &NodeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_address(&mut errors, "connector.bind_address", &config.connector.bind_address);
    check_address(&mut errors, "membership.bind_address", &config.membership.bind_address);
    for peer in &config.membership.peers {
        check_address(&mut errors, "membership.peers", peer);
    }
    if config.observability.metrics_enabled {
        check_address(&mut errors, "observability.metrics_address", &config.observability.metrics_address);
    }

    if let Some(host) = &config.membership.advertise_host {
        if host.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::InvalidAddress {
                field: "membership.advertise_host",
                value: host.clone(),
            });
        }
    }

    let positive: [(&'static str, u64); 8] = [
        ("connector.max_connections", config.connector.max_connections as u64),
        ("connector.worker_threads", config.connector.worker_threads as u64),
        ("connector.queue_capacity", config.connector.queue_capacity as u64),
        ("connector.connection_timeout_ms", config.connector.connection_timeout_ms),
        ("connector.timeout_scan_interval_ms", config.connector.timeout_scan_interval_ms),
        ("membership.heartbeat_interval_ms", config.membership.heartbeat_interval_ms),
        ("sender.ack_timeout_ms", config.sender.ack_timeout_ms),
        ("sender.queue_capacity", config.sender.queue_capacity as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.membership.heartbeat_interval_ms >= config.membership.expiration_ms {
        errors.push(ValidationError::HeartbeatTooSlow {
            interval: config.membership.heartbeat_interval_ms,
            expiration: config.membership.expiration_ms,
        });
    }

    if let Some(group) = &config.membership.multicast_group {
        match group.parse::<Ipv4Addr>() {
            Ok(addr) if addr.is_multicast() => {}
            _ => errors.push(ValidationError::NotMulticast(group.clone())),
        }
    }

    if let Some(payload) = &config.membership.payload {
        if payload.len() > MAX_MEMBER_PAYLOAD {
            errors.push(ValidationError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_MEMBER_PAYLOAD,
            });
        }
    }

    if config.connector.accept_backoff_base_ms > config.connector.accept_backoff_max_ms {
        errors.push(ValidationError::BackoffRange);
    }

    match config.observability.log_format.as_str() {
        "pretty" | "compact" => {}
        other => errors.push(ValidationError::LogFormat(other.to_string())),
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
