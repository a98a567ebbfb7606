//! Cluster node library: connection admission and dispatch, heartbeat
//! membership, and reliable group messaging.

// Connector core
pub mod net;

// Cluster
pub mod channel;
pub mod membership;
pub mod wire;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use channel::{ChannelError, GroupChannel, Reliability};
pub use config::NodeConfig;
pub use lifecycle::Shutdown;
pub use membership::{Member, MemberId};
pub use net::{AdmissionLatch, Endpoint};
