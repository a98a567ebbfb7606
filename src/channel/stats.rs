//! Message and byte counters, reported periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::channel::interceptor::{ChannelInterceptor, InterceptorError};
use crate::channel::message::ChannelMessage;
use crate::membership::Member;
use crate::observability::metrics;

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

/// Counts every message that passes through, in both directions.
pub struct StatisticsInterceptor {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    report_every: Duration,
    last_report: Mutex<Instant>,
}

impl StatisticsInterceptor {
    pub fn new(report_every: Duration) -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            report_every,
            last_report: Mutex::new(Instant::now()),
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    fn maybe_report(&self) {
        if self.report_every.is_zero() {
            return;
        }
        {
            let mut last = self.last_report.lock().expect("statistics report clock poisoned");
            if last.elapsed() < self.report_every {
                return;
            }
            *last = Instant::now();
        }
        let snapshot = self.snapshot();
        tracing::info!(
            messages_sent = snapshot.messages_sent,
            bytes_sent = snapshot.bytes_sent,
            messages_received = snapshot.messages_received,
            bytes_received = snapshot.bytes_received,
            "Channel statistics"
        );
    }
}

impl ChannelInterceptor for StatisticsInterceptor {
    fn name(&self) -> &'static str {
        "statistics"
    }

    fn send_message(
        &self,
        msg: ChannelMessage,
        destinations: &[Member],
    ) -> Result<Option<ChannelMessage>, InterceptorError> {
        let bytes = msg.payload().len() * destinations.len();
        self.messages_sent
            .fetch_add(destinations.len() as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        metrics::record_interceptor_bytes("outbound", bytes);
        self.maybe_report();
        Ok(Some(msg))
    }

    fn message_received(&self, msg: ChannelMessage) -> Result<Option<ChannelMessage>, InterceptorError> {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(msg.payload().len() as u64, Ordering::Relaxed);
        metrics::record_interceptor_bytes("inbound", msg.payload().len());
        self.maybe_report();
        Ok(Some(msg))
    }
}
