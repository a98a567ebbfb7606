//! Length-prefixed framing for [`Frame`]s over a byte stream.
//!
//! ```text
//! u32 length | kind (1 message, 2 ack, 3 nack) | body
//!
//! message: reliability u8 | options u32 | id [16] | timestamp u64
//!          | source (u16-prefixed member record) | payload (u32-prefixed)
//! ack:     id [16] | member id [16]
//! nack:    id [16] | member id [16] | reason (u16-prefixed UTF-8)
//! ```

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::channel::message::{ChannelMessage, Frame, MessageId, Reliability};
use crate::membership::{Member, MemberId};
use crate::wire::{put_long_bytes, put_short_bytes, put_u32, put_u64, WireError, WireReader};

const KIND_MESSAGE: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_NACK: u8 = 3;

/// Errors reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// Frame body without the outer length prefix.
pub fn encode_body(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    match frame {
        Frame::Message(msg) => {
            buf.push(KIND_MESSAGE);
            buf.push(msg.reliability() as u8);
            put_u32(&mut buf, msg.options());
            buf.extend_from_slice(msg.id().0.as_bytes());
            put_u64(&mut buf, msg.timestamp_ms());
            msg.source().encode_prefixed(&mut buf);
            put_long_bytes(&mut buf, msg.payload());
        }
        Frame::Ack { id, from } => {
            buf.push(KIND_ACK);
            buf.extend_from_slice(id.0.as_bytes());
            buf.extend_from_slice(from.as_bytes());
        }
        Frame::Nack { id, from, reason } => {
            buf.push(KIND_NACK);
            buf.extend_from_slice(id.0.as_bytes());
            buf.extend_from_slice(from.as_bytes());
            put_short_bytes(&mut buf, reason.as_bytes());
        }
    }
    buf
}

/// Frame with its length prefix, ready to write.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let body = encode_body(frame);
    let mut out = Vec::with_capacity(body.len() + 4);
    put_u32(&mut out, body.len() as u32);
    out.extend_from_slice(&body);
    out
}

/// Decode a frame body (without length prefix).
pub fn decode_body(body: &[u8], max_payload: usize) -> Result<Frame, WireError> {
    let mut reader = WireReader::new(body);
    let frame = match reader.u8()? {
        KIND_MESSAGE => {
            let reliability = Reliability::try_from(reader.u8()?).map_err(WireError::Reliability)?;
            let options = reader.u32()?;
            let id = MessageId(Uuid::from_bytes(reader.array::<16>()?));
            let timestamp_ms = reader.u64()?;
            let source = Member::decode_prefixed(&mut reader)?;
            let payload = reader.long_bytes(max_payload)?;
            Frame::Message(ChannelMessage::from_parts(
                id,
                timestamp_ms,
                source,
                reliability,
                options,
                payload,
            ))
        }
        KIND_ACK => Frame::Ack {
            id: MessageId(Uuid::from_bytes(reader.array::<16>()?)),
            from: MemberId(reader.array::<16>()?),
        },
        KIND_NACK => {
            let id = MessageId(Uuid::from_bytes(reader.array::<16>()?));
            let from = MemberId(reader.array::<16>()?);
            let reason = String::from_utf8(reader.short_bytes()?)
                .map_err(|_| WireError::Utf8("nack reason"))?;
            Frame::Nack { id, from, reason }
        }
        other => return Err(WireError::FrameKind(other)),
    };
    reader.finish()?;
    Ok(frame)
}

/// Read one frame. `Ok(None)` means the peer closed the stream between
/// frames; closing partway through the length prefix is an I/O error.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    let first = reader.read(&mut len).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len[first..]).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > max_frame {
        return Err(FrameError::TooLarge {
            size: len,
            limit: max_frame,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode_body(&body, max_frame)?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(frame)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    fn source() -> Member {
        Member::new(MemberId::new(), "10.1.2.3".parse().unwrap(), 4000).with_udp_port(45564)
    }

    #[tokio::test]
    async fn message_survives_stream() {
        let msg = ChannelMessage::new(source(), b"payload".to_vec(), Reliability::AckAfterProcessing, 5);
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, &Frame::Message(msg.clone())).await.unwrap();
        let Some(Frame::Message(got)) = read_frame(&mut server, LIMIT).await.unwrap() else {
            panic!("expected a message frame");
        };

        assert_eq!(got.id(), msg.id());
        assert_eq!(got.timestamp_ms(), msg.timestamp_ms());
        assert_eq!(got.source().id, msg.source().id);
        assert_eq!(got.source().udp_port, Some(45564));
        assert_eq!(got.reliability(), Reliability::AckAfterProcessing);
        assert_eq!(got.options(), 5);
        assert_eq!(got.payload(), b"payload");
    }

    #[tokio::test]
    async fn nack_reason_preserved() {
        let frame = Frame::Nack {
            id: MessageId::new(),
            from: MemberId::new(),
            reason: "listener failed".into(),
        };
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &frame).await.unwrap();
        assert_eq!(read_frame(&mut server, LIMIT).await.unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, LIMIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_length_prefix_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server, LIMIT).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn length_prefix_split_across_writes() {
        let frame = Frame::Ack {
            id: MessageId::new(),
            from: MemberId::new(),
        };
        let bytes = encode_frame(&frame);
        let (mut client, mut server) = tokio::io::duplex(64);
        let reader = tokio::spawn(async move { read_frame(&mut server, LIMIT).await });

        client.write_all(&bytes[..1]).await.unwrap();
        tokio::task::yield_now().await;
        client.write_all(&bytes[1..]).await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), Some(frame));
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(LIMIT as u32 + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server, LIMIT).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn unknown_kind_and_reliability() {
        assert_eq!(decode_body(&[9], LIMIT), Err(WireError::FrameKind(9)));
        assert_eq!(decode_body(&[KIND_MESSAGE, 7], LIMIT), Err(WireError::Reliability(7)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut body = encode_body(&Frame::Ack {
            id: MessageId::new(),
            from: MemberId::new(),
        });
        body.push(0);
        assert_eq!(decode_body(&body, LIMIT), Err(WireError::TrailingBytes(1)));
    }
}
