use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::wire::{put_ip, put_short_bytes, put_u16, put_u32, WireError, WireReader};

/// Largest member payload carried in a heartbeat.
pub const MAX_MEMBER_PAYLOAD: usize = 16 * 1024;

/// Unique identity token of a cluster member.
///
/// Membership matches on this, never on network address, so a member that
/// changes address keeps its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub [u8; 16]);

impl MemberId {
    pub fn new() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

/// A cluster member as advertised in its heartbeats.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub host: IpAddr,
    /// TCP port of the member's message receiver.
    pub port: u16,
    pub secure_port: Option<u16>,
    /// UDP port heartbeats reach the member on.
    pub udp_port: Option<u16>,
    /// Opaque application data, at most [`MAX_MEMBER_PAYLOAD`] bytes.
    payload: Vec<u8>,
}

impl Member {
    pub fn new(id: MemberId, host: IpAddr, port: u16) -> Self {
        Self {
            id,
            host,
            port,
            secure_port: None,
            udp_port: None,
            payload: Vec::new(),
        }
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }

    pub fn with_secure_port(mut self, port: u16) -> Self {
        self.secure_port = Some(port);
        self
    }

    /// Attach application data. Payloads over [`MAX_MEMBER_PAYLOAD`] are refused.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Result<Self, WireError> {
        if payload.len() > MAX_MEMBER_PAYLOAD {
            return Err(WireError::TooLarge {
                size: payload.len(),
                limit: MAX_MEMBER_PAYLOAD,
            });
        }
        self.payload = payload;
        Ok(self)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Where messages for this member are sent.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Where heartbeats for this member are sent, if it advertised a UDP port.
    pub fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_port.map(|port| SocketAddr::new(self.host, port))
    }

    /// Append the binary form of this record.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.id.0);
        put_ip(buf, self.host);
        put_u16(buf, self.port);
        put_u16(buf, self.secure_port.unwrap_or(0));
        put_u16(buf, self.udp_port.unwrap_or(0));
        put_u32(buf, self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }

    pub(crate) fn decode_from(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let id = MemberId(reader.array::<16>()?);
        let host = reader.ip()?;
        let port = reader.u16()?;
        let secure_port = non_zero(reader.u16()?);
        let udp_port = non_zero(reader.u16()?);
        let payload = reader.long_bytes(MAX_MEMBER_PAYLOAD)?;
        Ok(Self {
            id,
            host,
            port,
            secure_port,
            udp_port,
            payload,
        })
    }

    /// Record wrapped in a u16 length prefix, for embedding in envelopes.
    pub(crate) fn encode_prefixed(&self, buf: &mut Vec<u8>) {
        let mut record = Vec::with_capacity(64);
        self.encode_into(&mut record);
        put_short_bytes(buf, &record);
    }

    pub(crate) fn decode_prefixed(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let record = reader.short_bytes()?;
        let mut inner = WireReader::new(&record);
        let member = Self::decode_from(&mut inner)?;
        inner.finish()?;
        Ok(member)
    }
}

fn non_zero(port: u16) -> Option<u16> {
    (port != 0).then_some(port)
}

/// Members are the same member when their identity tokens match.
impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address())
    }
}
