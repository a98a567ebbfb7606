//! Reliable multi-destination sender.
//!
//! # Responsibilities
//! - Keep one writer task and queue per destination member
//! - Wait for ACK / ACK-after-processing under a bounded timeout
//! - Retry faulty destinations a bounded number of times
//! - Aggregate what still fails into one error naming every member
//!
//! # Data Flow
//! ```text
//! send(msg, [m1, m2, m3])
//!   ├─► peer(m1).queue ─► writer task ─► TCP ─► (ack?) ─┐
//!   ├─► peer(m2).queue ─► writer task ─► TCP ─► (ack?) ─┼─► faults ─► retry round
//!   └─► peer(m3).queue ─► writer task ─► TCP ─► (ack?) ─┘
//! ```
//!
//! # Design Decisions
//! - Reliability `None` succeeds once the frame is queued
//! - One frame in flight per peer connection, so acks arrive in order
//! - Any transport error drops the peer connection; the next frame reconnects
//! - A cached connection the peer has closed is replaced before use, and a
//!   write or read failure on a reused connection gets one fresh reconnect
//! - A caller that gave up (timeout) leaves its frame unsent

use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::codec::{encode_frame, read_frame};
use crate::channel::error::{ChannelError, FaultyMember, SendFault};
use crate::channel::message::{ChannelMessage, Frame, MessageId, Reliability};
use crate::config::SenderConfig;
use crate::membership::{Member, MemberId};
use crate::observability::metrics;
use crate::resilience::retries::RetryPolicy;

#[derive(Debug, Clone, Copy)]
struct PeerSettings {
    connect_timeout: Duration,
    ack_timeout: Duration,
    max_frame: usize,
    queue_capacity: usize,
}

struct Outgoing {
    id: MessageId,
    reliability: Reliability,
    bytes: Arc<Vec<u8>>,
    done: Option<oneshot::Sender<Result<(), SendFault>>>,
}

/// Queue and writer task for one destination.
struct PeerSender {
    member: Member,
    tx: mpsc::Sender<Outgoing>,
    task: JoinHandle<()>,
}

impl PeerSender {
    fn spawn(member: Member, settings: PeerSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let task = tokio::spawn(writer_loop(member.clone(), rx, settings));
        tracing::debug!(member = %member, "Peer sender started");
        Self { member, tx, task }
    }
}

impl Drop for PeerSender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sends framed messages to members with per-destination fault reporting.
pub struct ReliableSender {
    local_id: MemberId,
    peers: DashMap<MemberId, Arc<PeerSender>>,
    settings: PeerSettings,
    retry: RetryPolicy,
    running: AtomicBool,
}

impl ReliableSender {
    pub fn new(local_id: MemberId, config: &SenderConfig) -> Self {
        Self {
            local_id,
            peers: DashMap::new(),
            settings: PeerSettings {
                connect_timeout: config.connect_timeout(),
                ack_timeout: config.ack_timeout(),
                max_frame: config.max_frame_bytes,
                queue_capacity: config.queue_capacity.max(1),
            },
            retry: RetryPolicy::from(config),
            running: AtomicBool::new(true),
        }
    }

    /// Deliver `msg` to every destination at the message's reliability level.
    pub async fn send(&self, msg: &ChannelMessage, destinations: &[Member]) -> Result<(), ChannelError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ChannelError::NotRunning);
        }
        if destinations.is_empty() {
            tracing::debug!(message_id = %msg.id(), "No destinations, nothing sent");
            return Ok(());
        }
        if destinations.iter().any(|m| m.id == self.local_id) {
            return Err(ChannelError::SelfLoopback);
        }

        let bytes = Arc::new(encode_frame(&Frame::Message(msg.clone())));
        let size = bytes.len() - 4;
        if size > self.settings.max_frame {
            return Err(ChannelError::TooLarge {
                size,
                limit: self.settings.max_frame,
            });
        }

        let reliability = msg.reliability();
        let mut pending: Vec<Member> = destinations.to_vec();
        let mut faults: Vec<FaultyMember> = Vec::new();

        for attempt in 0..self.retry.attempts() {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt);
                tracing::debug!(
                    message_id = %msg.id(),
                    retry = attempt,
                    destinations = pending.len(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying faulty destinations"
                );
                tokio::time::sleep(delay).await;
            }

            let results = join_all(
                pending
                    .iter()
                    .map(|member| self.deliver(member, msg.id(), reliability, bytes.clone())),
            )
            .await;

            faults = pending
                .drain(..)
                .zip(results)
                .filter_map(|(member, result)| {
                    result.err().map(|cause| FaultyMember { member, cause })
                })
                .collect();
            if faults.is_empty() {
                break;
            }
            for fault in &faults {
                tracing::debug!(
                    message_id = %msg.id(),
                    member = %fault.member,
                    attempt,
                    cause = %fault.cause,
                    "Destination faulted"
                );
            }
            pending = faults.iter().map(|f| f.member.clone()).collect();
        }

        let delivered = destinations.len() - faults.len();
        for _ in 0..delivered {
            metrics::record_message_sent(reliability.label(), "ok");
        }
        if faults.is_empty() {
            return Ok(());
        }
        for fault in &faults {
            metrics::record_message_sent(reliability.label(), "failed");
            tracing::warn!(
                message_id = %msg.id(),
                member = %fault.member,
                cause = %fault.cause,
                "Delivery failed after retries"
            );
        }
        Err(ChannelError::Faulty(faults))
    }

    async fn deliver(
        &self,
        member: &Member,
        id: MessageId,
        reliability: Reliability,
        bytes: Arc<Vec<u8>>,
    ) -> Result<(), SendFault> {
        let peer = self.peer(member);
        let (done, wait) = if reliability.wants_ack() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        peer.tx
            .try_send(Outgoing {
                id,
                reliability,
                bytes,
                done,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendFault::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SendFault::Closed,
            })?;

        let Some(wait) = wait else {
            return Ok(());
        };
        let bound = self.settings.connect_timeout + self.settings.ack_timeout;
        match tokio::time::timeout(bound, wait).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SendFault::Closed),
            Err(_) => Err(SendFault::AckTimeout),
        }
    }

    /// Writer for `member`, replaced if the member now advertises a new address.
    fn peer(&self, member: &Member) -> Arc<PeerSender> {
        let mut entry = self
            .peers
            .entry(member.id)
            .or_insert_with(|| Arc::new(PeerSender::spawn(member.clone(), self.settings)));
        if entry.member.address() != member.address() || entry.tx.is_closed() {
            *entry = Arc::new(PeerSender::spawn(member.clone(), self.settings));
        }
        entry.value().clone()
    }

    /// Drop the queue and connection for a departed member.
    pub fn disconnect(&self, id: &MemberId) {
        if self.peers.remove(id).is_some() {
            tracing::debug!(member = %id, "Peer sender dropped");
        }
    }

    pub fn connected_peers(&self) -> usize {
        self.peers.len()
    }

    /// Refuse further sends and drop every peer.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.peers.clear();
    }
}

async fn writer_loop(member: Member, mut rx: mpsc::Receiver<Outgoing>, settings: PeerSettings) {
    let mut stream: Option<TcpStream> = None;
    while let Some(out) = rx.recv().await {
        if out.done.as_ref().is_some_and(|done| done.is_closed()) {
            continue;
        }
        let result = transmit(&mut stream, &member, &out, &settings).await;
        if result.is_err() {
            stream = None;
        }
        match out.done {
            Some(done) => {
                let _ = done.send(result);
            }
            None => {
                if let Err(fault) = result {
                    tracing::debug!(member = %member, message_id = %out.id, cause = %fault, "Unacknowledged send failed");
                }
            }
        }
    }
    tracing::debug!(member = %member, "Peer sender stopped");
}

/// Send one frame, reconnecting once if a cached connection turns out dead.
async fn transmit(
    stream: &mut Option<TcpStream>,
    member: &Member,
    out: &Outgoing,
    settings: &PeerSettings,
) -> Result<(), SendFault> {
    if stream.as_ref().is_some_and(peer_closed) {
        tracing::debug!(member = %member, "Peer closed idle connection, reconnecting");
        *stream = None;
    }
    let reused = stream.is_some();
    match exchange(stream, member, out, settings).await {
        Err(SendFault::Io(cause)) if reused => {
            tracing::debug!(member = %member, cause = %cause, "Cached connection failed, reconnecting");
            *stream = None;
            exchange(stream, member, out, settings).await
        }
        result => result,
    }
}

/// Whether the peer has shut down or reset `stream`. Unread bytes (a late
/// acknowledgment) do not count.
fn peer_closed(stream: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    matches!(stream.peek(&mut byte).now_or_never(), Some(Ok(0)) | Some(Err(_)))
}

async fn exchange(
    stream: &mut Option<TcpStream>,
    member: &Member,
    out: &Outgoing,
    settings: &PeerSettings,
) -> Result<(), SendFault> {
    if stream.is_none() {
        *stream = Some(connect(member, settings.connect_timeout).await?);
    }
    let Some(conn) = stream.as_mut() else {
        return Err(SendFault::Closed);
    };

    conn.write_all(&out.bytes)
        .await
        .map_err(|e| SendFault::Io(e.to_string()))?;
    conn.flush().await.map_err(|e| SendFault::Io(e.to_string()))?;

    if !out.reliability.wants_ack() {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + settings.ack_timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, read_frame(conn, settings.max_frame)).await {
            Err(_) => return Err(SendFault::AckTimeout),
            Ok(Err(e)) => return Err(SendFault::Protocol(e.to_string())),
            Ok(Ok(None)) => return Err(SendFault::Io("connection closed before acknowledgment".into())),
            Ok(Ok(Some(frame))) => frame,
        };
        match frame {
            Frame::Ack { id, .. } if id == out.id => return Ok(()),
            Frame::Nack { id, reason, .. } if id == out.id => return Err(SendFault::Nack(reason)),
            other => {
                tracing::trace!(member = %member, kind = other.kind(), "Ignoring unrelated frame");
            }
        }
    }
}

async fn connect(member: &Member, timeout: Duration) -> Result<TcpStream, SendFault> {
    let addr = member.address();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SendFault::Connect(format!("{addr}: timed out")))?
        .map_err(|e| SendFault::Connect(format!("{addr}: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(member = %member, error = %e, "Failed to set TCP_NODELAY");
    }
    tracing::debug!(member = %member, "Connected to peer");
    Ok(stream)
}
