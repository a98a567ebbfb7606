//! Cluster membership.
//!
//! # Responsibilities
//! - Member identity and record encoding ([`member`])
//! - Heartbeat datagram format ([`heartbeat`])
//! - Local view of live members with staleness eviction ([`table`])
//! - UDP heartbeat broadcast and receipt ([`service`])

pub mod heartbeat;
pub mod member;
pub mod service;
pub mod table;

pub use heartbeat::Heartbeat;
pub use member::{Member, MemberId, MAX_MEMBER_PAYLOAD};
pub use service::{MembershipError, MembershipListener, MembershipService};
pub use table::{MembershipTable, Observed};
