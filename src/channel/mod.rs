//! Cluster messaging.
//!
//! # Responsibilities
//! - Message envelope and frame codec ([`message`], [`codec`])
//! - Ordered interceptor chain and built-in stages ([`interceptor`], [`stats`], [`compress`])
//! - Reliable multi-destination sending ([`sender`])
//! - Frame receipt and acknowledgment on the connector ([`receiver`])
//! - The assembled [`GroupChannel`] ([`group`])

pub mod codec;
pub mod compress;
pub mod error;
pub mod group;
pub mod interceptor;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod stats;

pub use compress::CompressionInterceptor;
pub use error::{ChannelError, FaultyMember, ProcessingError, SendFault, StartError};
pub use group::{ChannelBuilder, ChannelListener, GroupChannel};
pub use interceptor::{ChannelInterceptor, InterceptorChain, InterceptorError, Passage};
pub use message::{options, ChannelMessage, Frame, MessageId, Reliability};
pub use receiver::{ClusterReceiver, MessageSink};
pub use sender::ReliableSender;
pub use stats::{StatisticsInterceptor, StatisticsSnapshot};
