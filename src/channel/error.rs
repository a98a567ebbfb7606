use std::fmt;
use thiserror::Error;

use crate::channel::interceptor::InterceptorError;
use crate::membership::{MembershipError, Member};
use crate::net::EndpointError;
use crate::wire::WireError;

/// Why delivery to one destination failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendFault {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("no acknowledgment within timeout")]
    AckTimeout,
    #[error("negative acknowledgment: {0}")]
    Nack(String),
    #[error("send queue full")]
    QueueFull,
    #[error("peer sender closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A destination still failing after every retry.
#[derive(Debug, Clone)]
pub struct FaultyMember {
    pub member: Member,
    pub cause: SendFault,
}

impl fmt::Display for FaultyMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.member, self.cause)
    }
}

/// Errors returned to channel callers.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot send to the local member")]
    SelfLoopback,
    #[error("delivery failed for {} member(s): {}", .0.len(), join(.0))]
    Faulty(Vec<FaultyMember>),
    #[error("channel is not running")]
    NotRunning,
    #[error("message of {size} bytes exceeds frame limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Interceptor(#[from] InterceptorError),
}

impl ChannelError {
    /// Destinations that failed, empty for non-delivery errors.
    pub fn faulty_members(&self) -> &[FaultyMember] {
        match self {
            ChannelError::Faulty(faults) => faults,
            _ => &[],
        }
    }
}

fn join(faults: &[FaultyMember]) -> String {
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Listener-side failure to process a message; sent back as a NACK.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Fatal channel startup errors. Nothing is left running when one is returned.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to start message endpoint: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("failed to start membership: {0}")]
    Membership(#[from] MembershipError),
    #[error("invalid advertise host '{0}'")]
    AdvertiseHost(String),
    #[error("invalid member payload: {0}")]
    Payload(#[source] WireError),
}
