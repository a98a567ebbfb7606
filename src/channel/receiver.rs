//! Inbound side of the message transport.
//!
//! Plugs into the connector as its [`ConnectionHandler`]: each processing
//! pass reads one frame, acknowledges according to the message's
//! reliability and hands the message to a [`MessageSink`].
//!
//! A pass only reads when input is already waiting. An idle connection
//! answers `Long` and is parked until it turns readable, so quiet peers
//! never hold a worker. The idle timeout is enforced by the dispatcher's
//! scan; a frame that stalls halfway is bounded by the same timeout.
//!
//! ```text
//! None                → deliver
//! Ack                 → ACK, then deliver
//! AckAfterProcessing  → deliver, then ACK (ok) or NACK (listener failed)
//! ```

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::Arc;

use crate::channel::codec::{read_frame, write_frame, FrameError};
use crate::channel::error::ProcessingError;
use crate::channel::message::{ChannelMessage, Frame, Reliability};
use crate::membership::MemberId;
use crate::net::{Connection, ConnectionHandler, SocketEvent, SocketState};
use crate::observability::metrics;

/// Where received messages go.
pub trait MessageSink: Send + Sync + 'static {
    /// Process one message. An error becomes a NACK when the sender asked
    /// for acknowledgment after processing.
    fn deliver(&self, msg: ChannelMessage) -> Result<(), ProcessingError>;
}

/// Frame-reading connection handler.
pub struct ClusterReceiver<S> {
    local_id: MemberId,
    sink: Arc<S>,
    max_frame: usize,
}

impl<S: MessageSink> ClusterReceiver<S> {
    pub fn new(local_id: MemberId, sink: Arc<S>, max_frame: usize) -> Self {
        Self {
            local_id,
            sink,
            max_frame,
        }
    }

    async fn read_one(&self, conn: &mut Connection) -> SocketState {
        let peer_addr = conn.peer_addr();
        let mut byte = [0u8; 1];
        match conn.stream().peek(&mut byte).now_or_never() {
            None => return SocketState::Long,
            Some(Ok(0)) => {
                tracing::trace!(connection_id = %conn.id(), "Peer closed connection");
                return SocketState::Closed;
            }
            Some(Err(e)) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Read failed");
                return SocketState::Closed;
            }
            Some(Ok(_)) => {}
        }

        let read = tokio::time::timeout(conn.timeout(), read_frame(conn.stream_mut(), self.max_frame)).await;
        let frame = match read {
            Err(_) => {
                tracing::debug!(connection_id = %conn.id(), peer_addr = %peer_addr, "Frame stalled past timeout");
                return SocketState::Closed;
            }
            Ok(Ok(None)) => {
                tracing::trace!(connection_id = %conn.id(), "Peer closed connection");
                return SocketState::Closed;
            }
            Ok(Err(FrameError::Io(e))) => {
                tracing::debug!(connection_id = %conn.id(), error = %e, "Read failed");
                return SocketState::Closed;
            }
            Ok(Err(e)) => {
                metrics::record_decode_error("frame");
                tracing::warn!(peer_addr = %peer_addr, error = %e, "Discarding malformed frame, closing");
                return SocketState::Closed;
            }
            Ok(Ok(Some(frame))) => frame,
        };

        let msg = match frame {
            Frame::Message(msg) => msg,
            other => {
                tracing::debug!(peer_addr = %peer_addr, kind = other.kind(), "Unexpected frame on receiver");
                return SocketState::Open;
            }
        };

        if msg.source().id == self.local_id {
            tracing::debug!(message_id = %msg.id(), "Dropping message from self");
            return SocketState::Open;
        }
        metrics::record_message_received(msg.reliability().label());

        if let Err(e) = self.handle(conn, msg).await {
            tracing::debug!(peer_addr = %peer_addr, error = %e, "Acknowledgment write failed");
            return SocketState::Closed;
        }

        if conn.consume_keep_alive() {
            SocketState::Open
        } else {
            tracing::debug!(connection_id = %conn.id(), "Keep-alive budget exhausted");
            SocketState::Closed
        }
    }

    async fn handle(&self, conn: &mut Connection, msg: ChannelMessage) -> Result<(), FrameError> {
        let id = msg.id();
        let ack = Frame::Ack {
            id,
            from: self.local_id,
        };
        match msg.reliability() {
            Reliability::None => self.deliver(msg),
            Reliability::Ack => {
                write_frame(conn.stream_mut(), &ack).await?;
                self.deliver(msg);
            }
            Reliability::AckAfterProcessing => {
                let reply = match self.sink.deliver(msg) {
                    Ok(()) => ack,
                    Err(e) => {
                        tracing::debug!(message_id = %id, error = %e, "Processing failed, sending NACK");
                        Frame::Nack {
                            id,
                            from: self.local_id,
                            reason: e.to_string(),
                        }
                    }
                };
                write_frame(conn.stream_mut(), &reply).await?;
            }
        }
        Ok(())
    }

    fn deliver(&self, msg: ChannelMessage) {
        let id = msg.id();
        if let Err(e) = self.sink.deliver(msg) {
            tracing::warn!(message_id = %id, error = %e, "Message processing failed");
        }
    }
}

impl<S: MessageSink> ConnectionHandler for ClusterReceiver<S> {
    fn process<'a>(&'a self, conn: &'a mut Connection, event: SocketEvent) -> BoxFuture<'a, SocketState> {
        Box::pin(async move {
            match event {
                SocketEvent::Timeout => SocketState::Closed,
                SocketEvent::OpenRead => self.read_one(conn).await,
            }
        })
    }
}
