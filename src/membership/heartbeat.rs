//! Heartbeat datagram format.
//!
//! ```text
//! +----------+-----------+------------------------------------------------+----------+
//! | CLHB-BEG | body len  | flags | member record         | known addrs    | CLHB-END |
//! | 8 bytes  | u32 BE    | u8    | id, host, ports, data | u16 n, n addrs | 8 bytes  |
//! +----------+-----------+------------------------------------------------+----------+
//! ```
//!
//! Flag bit 0 set means the member is alive; clear means it is leaving.
//! Known addresses are the heartbeat (UDP) addresses of members the sender
//! currently sees, so seeds introduce members to each other.

use std::net::SocketAddr;

use crate::membership::member::Member;
use crate::wire::{put_socket_addr, put_u16, put_u32, WireError, WireReader};

/// Most introductions carried in one heartbeat.
pub const MAX_KNOWN: usize = 64;

pub const HEARTBEAT_START: [u8; 8] = *b"CLHB-BEG";
pub const HEARTBEAT_END: [u8; 8] = *b"CLHB-END";

const FLAG_ALIVE: u8 = 0x01;

/// One heartbeat: a member record, its liveness flag and the sender's
/// known peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub member: Member,
    pub alive: bool,
    pub known: Vec<SocketAddr>,
}

impl Heartbeat {
    pub fn alive(member: Member) -> Self {
        Self {
            member,
            alive: true,
            known: Vec::new(),
        }
    }

    pub fn leaving(member: Member) -> Self {
        Self {
            member,
            alive: false,
            known: Vec::new(),
        }
    }

    /// Attach introductions; anything past [`MAX_KNOWN`] is dropped.
    pub fn with_known(mut self, mut known: Vec<SocketAddr>) -> Self {
        known.truncate(MAX_KNOWN);
        self.known = known;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.member.payload().len());
        body.push(if self.alive { FLAG_ALIVE } else { 0 });
        self.member.encode_into(&mut body);
        let known = &self.known[..self.known.len().min(MAX_KNOWN)];
        put_u16(&mut body, known.len() as u16);
        for addr in known {
            put_socket_addr(&mut body, *addr);
        }

        let mut out = Vec::with_capacity(body.len() + 20);
        out.extend_from_slice(&HEARTBEAT_START);
        put_u32(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
        out.extend_from_slice(&HEARTBEAT_END);
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(datagram);
        if reader.array::<8>()? != HEARTBEAT_START {
            return Err(WireError::BadStartMarker);
        }
        let declared = reader.u32()? as usize;
        let actual = reader.remaining().saturating_sub(HEARTBEAT_END.len());
        if declared != actual {
            return Err(WireError::LengthMismatch { declared, actual });
        }

        let body = reader.bytes(declared)?;
        if reader.array::<8>()? != HEARTBEAT_END {
            return Err(WireError::BadEndMarker);
        }
        reader.finish()?;

        let mut body = WireReader::new(&body);
        let flags = body.u8()?;
        let member = Member::decode_from(&mut body)?;
        let count = body.u16()? as usize;
        if count > MAX_KNOWN {
            return Err(WireError::TooLarge {
                size: count,
                limit: MAX_KNOWN,
            });
        }
        let known = (0..count)
            .map(|_| body.socket_addr())
            .collect::<Result<Vec<_>, _>>()?;
        body.finish()?;

        Ok(Self {
            member,
            alive: flags & FLAG_ALIVE != 0,
            known,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::member::MemberId;

    fn sample() -> Member {
        Member::new(MemberId::new(), "192.168.1.20".parse().unwrap(), 4000)
            .with_udp_port(45564)
            .with_secure_port(4443)
            .with_payload(b"rack=7".to_vec())
            .unwrap()
    }

    #[test]
    fn round_trip_preserves_identity_and_ports() {
        let member = sample();
        let decoded = Heartbeat::decode(&Heartbeat::alive(member.clone()).encode()).unwrap();

        assert!(decoded.alive);
        assert_eq!(decoded.member.id, member.id);
        assert_eq!(decoded.member.host, member.host);
        assert_eq!(decoded.member.port, 4000);
        assert_eq!(decoded.member.secure_port, Some(4443));
        assert_eq!(decoded.member.udp_port, Some(45564));
        assert_eq!(decoded.member.payload(), b"rack=7");
    }

    #[test]
    fn introductions_survive_and_are_capped() {
        let known: Vec<SocketAddr> = (0..100u16)
            .map(|i| SocketAddr::from(([10, 0, 0, 1], 40000 + i)))
            .collect();
        let heartbeat = Heartbeat::alive(sample()).with_known(known.clone());
        let decoded = Heartbeat::decode(&heartbeat.encode()).unwrap();

        assert_eq!(decoded.known.len(), MAX_KNOWN);
        assert_eq!(decoded.known[..], known[..MAX_KNOWN]);
    }

    #[test]
    fn leaving_flag_survives() {
        let decoded = Heartbeat::decode(&Heartbeat::leaving(sample()).encode()).unwrap();
        assert!(!decoded.alive);
    }

    #[test]
    fn rejects_wrong_start_marker() {
        let mut bytes = Heartbeat::alive(sample()).encode();
        bytes[0] = b'X';
        assert_eq!(Heartbeat::decode(&bytes), Err(WireError::BadStartMarker));
    }

    #[test]
    fn rejects_wrong_end_marker() {
        let mut bytes = Heartbeat::alive(sample()).encode();
        let last = bytes.len() - 1;
        bytes[last] = b'X';
        assert_eq!(Heartbeat::decode(&bytes), Err(WireError::BadEndMarker));
    }

    #[test]
    fn rejects_truncated_datagram() {
        let bytes = Heartbeat::alive(sample()).encode();
        let err = Heartbeat::decode(&bytes[..bytes.len() - 10]).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));

        assert_eq!(Heartbeat::decode(&bytes[..5]), Err(WireError::Truncated));
    }
}
