//! Shared binary encoding helpers for heartbeats and envelopes.
//!
//! All integers are big-endian. Variable-length fields carry an explicit
//! length prefix and are bounds-checked before any allocation.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

/// Malformed or truncated input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("input truncated")]
    Truncated,
    #[error("bad start marker")]
    BadStartMarker,
    #[error("bad end marker")]
    BadEndMarker,
    #[error("declared length {declared} but {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
    #[error("unknown address family {0}")]
    AddressFamily(u8),
    #[error("unknown frame kind {0}")]
    FrameKind(u8),
    #[error("unknown reliability level {0}")]
    Reliability(u8),
    #[error("field of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("invalid UTF-8 in {0}")]
    Utf8(&'static str),
}

/// Bounds-checked reader over a byte slice.
pub(crate) struct WireReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len();
        len.saturating_sub(self.cursor.position() as usize)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, WireError> {
        self.cursor.read_u8().map_err(|_| WireError::Truncated)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, WireError> {
        self.cursor.read_u16::<BigEndian>().map_err(|_| WireError::Truncated)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, WireError> {
        self.cursor.read_u32::<BigEndian>().map_err(|_| WireError::Truncated)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, WireError> {
        self.cursor.read_u64::<BigEndian>().map_err(|_| WireError::Truncated)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| WireError::Truncated)?;
        Ok(out)
    }

    pub(crate) fn bytes(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        if len > self.remaining() {
            return Err(WireError::Truncated);
        }
        let mut out = vec![0u8; len];
        self.cursor
            .read_exact(&mut out)
            .map_err(|_| WireError::Truncated)?;
        Ok(out)
    }

    /// u16 length prefix, then bytes.
    pub(crate) fn short_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    /// u32 length prefix, then bytes.
    pub(crate) fn long_bytes(&mut self, limit: usize) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        if len > limit {
            return Err(WireError::TooLarge { size: len, limit });
        }
        self.bytes(len)
    }

    /// Address family byte (4 or 6), then the octets.
    pub(crate) fn ip(&mut self) -> Result<IpAddr, WireError> {
        match self.u8()? {
            4 => Ok(IpAddr::V4(Ipv4Addr::from(self.array::<4>()?))),
            6 => Ok(IpAddr::V6(Ipv6Addr::from(self.array::<16>()?))),
            other => Err(WireError::AddressFamily(other)),
        }
    }

    pub(crate) fn socket_addr(&mut self) -> Result<SocketAddr, WireError> {
        let ip = self.ip()?;
        Ok(SocketAddr::new(ip, self.u16()?))
    }

    pub(crate) fn finish(self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_ip(buf: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            buf.push(4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(6);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

pub(crate) fn put_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    put_ip(buf, addr.ip());
    put_u16(buf, addr.port());
}

/// u16 length prefix, then bytes. Longer input is truncated to `u16::MAX`.
pub(crate) fn put_short_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(u16::MAX as usize);
    put_u16(buf, len as u16);
    buf.extend_from_slice(&bytes[..len]);
}

/// u32 length prefix, then bytes.
pub(crate) fn put_long_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_truncation() {
        let mut reader = WireReader::new(&[0x00, 0x01, 0x02]);
        assert_eq!(reader.u16().unwrap(), 1);
        assert_eq!(reader.u16(), Err(WireError::Truncated));
    }

    #[test]
    fn long_bytes_respects_limit() {
        let mut buf = Vec::new();
        put_long_bytes(&mut buf, &[7u8; 32]);

        let mut reader = WireReader::new(&buf);
        assert_eq!(
            reader.long_bytes(16),
            Err(WireError::TooLarge { size: 32, limit: 16 })
        );
    }

    #[test]
    fn declared_length_beyond_input_is_truncation() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1_000_000);
        buf.push(1);

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.long_bytes(usize::MAX), Err(WireError::Truncated));
    }

    #[test]
    fn socket_addresses_of_both_families() {
        let mut buf = Vec::new();
        put_socket_addr(&mut buf, "10.0.0.1:80".parse().unwrap());
        put_socket_addr(&mut buf, "[fe80::1]:443".parse().unwrap());

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.socket_addr().unwrap(), "10.0.0.1:80".parse().unwrap());
        assert_eq!(reader.socket_addr().unwrap(), "[fe80::1]:443".parse().unwrap());
        reader.finish().unwrap();
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let mut reader = WireReader::new(&[1, 2, 3]);
        reader.u8().unwrap();
        assert_eq!(reader.finish(), Err(WireError::TrailingBytes(2)));
    }
}
