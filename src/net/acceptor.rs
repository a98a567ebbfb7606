//! Accept loop with admission control.
//!
//! # Responsibilities
//! - Wait for admission before accepting (backpressure)
//! - Accept, configure and dispatch connections
//! - Survive accept errors with bounded backoff
//! - Support pause / resume / end
//!
//! # State Machine
//! ```text
//! Running ⇄ Paused      (pause / resume)
//! Running | Paused → Ended  (stop or shutdown signal)
//! ```
//!
//! # Design Decisions
//! - Admission is acquired before accept, so accept is never the overload bottleneck
//! - Every exit path after admission either hands the permit to a connection
//!   or drops it; no permit or socket outlives a failed step

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{Connection, ConnectionSettings, SocketEvent};
use crate::net::dispatch::{ConnectionHandler, WorkerDispatch};
use crate::net::latch::AdmissionLatch;
use crate::net::listener::SocketConfigurator;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

const PAUSE_POLL: Duration = Duration::from_millis(50);

/// Accept loop state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Paused = 0,
    Running = 1,
    Ended = 2,
}

impl From<u8> for AcceptorState {
    fn from(val: u8) -> Self {
        match val {
            0 => AcceptorState::Paused,
            1 => AcceptorState::Running,
            _ => AcceptorState::Ended,
        }
    }
}

/// Shared control over a running accept loop.
#[derive(Debug, Clone)]
pub struct AcceptorHandle {
    state: Arc<AtomicU8>,
}

impl AcceptorHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(AcceptorState::Running as u8)),
        }
    }

    pub fn state(&self) -> AcceptorState {
        AcceptorState::from(self.state.load(Ordering::SeqCst))
    }

    /// Stop accepting until `resume`. Has no effect once ended.
    pub fn pause(&self) {
        let _ = self.state.compare_exchange(
            AcceptorState::Running as u8,
            AcceptorState::Paused as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn resume(&self) {
        let _ = self.state.compare_exchange(
            AcceptorState::Paused as u8,
            AcceptorState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn end(&self) {
        self.state.store(AcceptorState::Ended as u8, Ordering::SeqCst);
    }
}

/// Everything the accept loop needs.
pub struct Acceptor<H> {
    listener: TcpListener,
    latch: Arc<AdmissionLatch>,
    dispatch: Arc<WorkerDispatch<H>>,
    configurator: Arc<dyn SocketConfigurator>,
    settings: ConnectionSettings,
    backoff: Backoff,
    handle: AcceptorHandle,
}

impl<H: ConnectionHandler> Acceptor<H> {
    pub fn new(
        listener: TcpListener,
        latch: Arc<AdmissionLatch>,
        dispatch: Arc<WorkerDispatch<H>>,
        configurator: Arc<dyn SocketConfigurator>,
        settings: ConnectionSettings,
        backoff: Backoff,
    ) -> Self {
        Self {
            listener,
            latch,
            dispatch,
            configurator,
            settings,
            backoff,
            handle: AcceptorHandle::new(),
        }
    }

    pub fn handle(&self) -> AcceptorHandle {
        self.handle.clone()
    }

    fn ended(&self, shutdown: &ShutdownSignal) -> bool {
        shutdown.is_triggered() || self.handle.state() == AcceptorState::Ended
    }

    /// Run until ended or shut down.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        tracing::info!(
            address = ?self.listener.local_addr().ok(),
            "Accept loop starting"
        );

        loop {
            if self.ended(&shutdown) {
                break;
            }
            if self.handle.state() == AcceptorState::Paused {
                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => continue,
                    _ = shutdown.recv() => break,
                }
            }

            let permit = tokio::select! {
                permit = self.latch.acquire_owned() => permit,
                _ = shutdown.recv() => break,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(error = %e, "Admission wait interrupted");
                    continue;
                }
            };
            // release_all at shutdown admits us unconditionally; don't accept then.
            if self.ended(&shutdown) {
                break;
            }

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.recv() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    self.backoff.reset();
                    if self.ended(&shutdown) {
                        tracing::debug!(peer_addr = %peer_addr, "Accepted during shutdown, closing");
                        break;
                    }
                    metrics::record_connection_accepted();
                    metrics::set_active_connections(self.latch.count());

                    if let Err(e) = self.configurator.configure(&stream) {
                        tracing::warn!(peer_addr = %peer_addr, error = %e, "Socket configuration failed, closing");
                        continue;
                    }

                    let conn = Connection::new(stream, peer_addr, Some(permit), self.settings);
                    tracing::debug!(
                        connection_id = %conn.id(),
                        peer_addr = %peer_addr,
                        admitted = self.latch.count(),
                        "Connection accepted"
                    );
                    if let Err(err) = self.dispatch.submit(conn, SocketEvent::OpenRead) {
                        tracing::warn!(peer_addr = %peer_addr, error = %err, "Dispatch rejected connection, closing");
                        err.into_connection().close().await;
                    }
                }
                Err(e) => {
                    drop(permit);
                    let transient = is_transient(&e);
                    metrics::record_accept_error(transient);
                    let delay = self.backoff.next_delay();
                    if transient {
                        tracing::debug!(error = %e, delay_ms = delay.as_millis() as u64, "Transient accept error");
                    } else {
                        tracing::error!(
                            error = %e,
                            consecutive = self.backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Accept failed"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }

        self.handle.end();
        tracing::info!("Accept loop ended");
    }
}

/// Errors caused by a single peer rather than the listener itself.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_transitions() {
        let handle = AcceptorHandle::new();
        assert_eq!(handle.state(), AcceptorState::Running);

        handle.pause();
        assert_eq!(handle.state(), AcceptorState::Paused);
        handle.resume();
        assert_eq!(handle.state(), AcceptorState::Running);

        handle.end();
        handle.resume();
        handle.pause();
        assert_eq!(handle.state(), AcceptorState::Ended);
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
