//! Message envelope and the frames exchanged between peers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::membership::{Member, MemberId};

/// Option flag bits carried by every message. Interceptors opt in on these.
pub mod options {
    /// Payload is zstd-compressed by the compression stage.
    pub const COMPRESS: u32 = 0x0000_0001;
}

/// Unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Delivery guarantee requested by the sender.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Reliability {
    /// Success once queued for transport.
    None = 0,
    /// Receiver acknowledges receipt.
    #[default]
    Ack = 1,
    /// Receiver acknowledges after its listeners processed the message.
    AckAfterProcessing = 2,
}

impl Reliability {
    pub fn label(self) -> &'static str {
        match self {
            Reliability::None => "none",
            Reliability::Ack => "ack",
            Reliability::AckAfterProcessing => "ack_after_processing",
        }
    }

    pub fn wants_ack(self) -> bool {
        !matches!(self, Reliability::None)
    }
}

impl TryFrom<u8> for Reliability {
    type Error = u8;

    fn try_from(val: u8) -> Result<Self, u8> {
        match val {
            0 => Ok(Reliability::None),
            1 => Ok(Reliability::Ack),
            2 => Ok(Reliability::AckAfterProcessing),
            other => Err(other),
        }
    }
}

impl std::str::FromStr for Reliability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "none" => Ok(Reliability::None),
            "ack" => Ok(Reliability::Ack),
            "ack-after-processing" | "ack_after_processing" => Ok(Reliability::AckAfterProcessing),
            other => Err(format!("unknown reliability '{other}'")),
        }
    }
}

/// A message travelling between members.
///
/// Immutable once built; interceptors and retransmission produce copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    id: MessageId,
    timestamp_ms: u64,
    source: Member,
    reliability: Reliability,
    options: u32,
    payload: Vec<u8>,
}

impl ChannelMessage {
    pub fn new(source: Member, payload: Vec<u8>, reliability: Reliability, options: u32) -> Self {
        Self {
            id: MessageId::new(),
            timestamp_ms: now_ms(),
            source,
            reliability,
            options,
            payload,
        }
    }

    pub(crate) fn from_parts(
        id: MessageId,
        timestamp_ms: u64,
        source: Member,
        reliability: Reliability,
        options: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            timestamp_ms,
            source,
            reliability,
            options,
            payload,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Creation time, milliseconds since the Unix epoch on the source's clock.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn source(&self) -> &Member {
        &self.source
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn options(&self) -> u32 {
        self.options
    }

    pub fn has_options(&self, flags: u32) -> bool {
        self.options & flags == flags
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Same message, relayed on behalf of another member.
    pub fn with_source(&self, source: Member) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }

    /// Same message with a transformed payload.
    pub fn with_payload(&self, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }
}

/// Frames on the message transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(ChannelMessage),
    Ack { id: MessageId, from: MemberId },
    Nack { id: MessageId, from: MemberId, reason: String },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Message(_) => "message",
            Frame::Ack { .. } => "ack",
            Frame::Nack { .. } => "nack",
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
