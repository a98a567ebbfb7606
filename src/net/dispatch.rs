//! Worker pool that runs protocol processing for admitted connections.
//!
//! # Responsibilities
//! - Queue connections for a fixed set of long-lived workers
//! - Act on the state each processing pass returns
//! - Park long-poll / async connections and time them out
//!
//! # State Handling
//! ```text
//! Closed               → socket closed, admission released
//! Open | Upgrading     → re-queued for another read cycle (inline if queue full)
//! Long                 → parked and watched, worker freed
//! AsyncWaiting         → parked, worker freed
//! Long + readable      → re-queued with OpenRead
//! parked + resume(id)  → re-queued with OpenRead
//! parked + idle > t/o  → removed, then re-queued with Timeout
//! ```
//!
//! # Design Decisions
//! - A connection is held by at most one worker at a time
//! - Removal from the waiting set is the claim: whoever removes an entry
//!   dispatches it, so readiness, resume and timeout never double-fire
//! - A watched connection lives in its watcher task; the waiting set holds
//!   its timing and a wake handle, and a claimer wakes the watcher with
//!   the event to dispatch
//! - Rejected submissions hand the connection back so the caller can close it
//! - At shutdown a pass blocked on I/O gets a short grace, then is dropped

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{Connection, ConnectionId, SocketEvent, SocketState};
use crate::observability::metrics;

/// How long an in-flight pass may keep running once shutdown is signalled.
/// Abandoning it drops the connection, which closes it and frees its slot.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Protocol processing invoked by a worker for each dispatch.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Run one processing pass and report what should happen next.
    fn process<'a>(
        &'a self,
        conn: &'a mut Connection,
        event: SocketEvent,
    ) -> BoxFuture<'a, SocketState>;
}

/// Rejected submission. Carries the connection back to the caller.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("worker pool is shut down")]
    Shutdown(Connection),
    #[error("worker queue is full")]
    Saturated(Connection),
}

impl SubmitError {
    pub fn into_connection(self) -> Connection {
        match self {
            SubmitError::Shutdown(conn) | SubmitError::Saturated(conn) => conn,
        }
    }
}

/// Error creating the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,
    #[error("worker queue capacity must be positive")]
    NoQueue,
}

/// Sizing for [`WorkerDispatch`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub scan_interval: Duration,
}

struct Job {
    conn: Connection,
    event: SocketEvent,
}

/// Entry in the waiting set.
enum Parked {
    /// Parked until resumed or timed out.
    Held(Connection),
    /// Owned by a readiness watcher; `wake` hands it the claimed event.
    Watched {
        last_access: Instant,
        timeout: Duration,
        wake: oneshot::Sender<SocketEvent>,
    },
}

impl Parked {
    fn is_expired(&self, now: Instant) -> bool {
        match self {
            Parked::Held(conn) => conn.is_expired(now),
            Parked::Watched {
                last_access,
                timeout,
                ..
            } => now.saturating_duration_since(*last_access) > *timeout,
        }
    }
}

struct DispatchInner<H> {
    handler: Arc<H>,
    tx: mpsc::Sender<Job>,
    rx: Mutex<mpsc::Receiver<Job>>,
    waiting: DashMap<ConnectionId, Parked>,
    running: AtomicBool,
}

/// Fixed-size worker pool.
pub struct WorkerDispatch<H> {
    inner: Arc<DispatchInner<H>>,
    config: DispatchConfig,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<H: ConnectionHandler> WorkerDispatch<H> {
    /// Create the pool. Workers start with [`WorkerDispatch::start`].
    pub fn new(handler: Arc<H>, config: DispatchConfig) -> Result<Self, DispatchError> {
        if config.workers == 0 {
            return Err(DispatchError::NoWorkers);
        }
        if config.queue_capacity == 0 {
            return Err(DispatchError::NoQueue);
        }
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Ok(Self {
            inner: Arc::new(DispatchInner {
                handler,
                tx,
                rx: Mutex::new(rx),
                waiting: DashMap::new(),
                running: AtomicBool::new(true),
            }),
            config,
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the workers and the timeout scanner.
    pub fn start(&self, shutdown: ShutdownSignal) {
        let mut tasks = self.tasks.lock().expect("dispatch task list poisoned");
        for worker in 0..self.config.workers {
            let inner = self.inner.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                inner.worker_loop(worker, shutdown).await;
            }));
        }

        let inner = self.inner.clone();
        let interval = self.config.scan_interval;
        tasks.push(tokio::spawn(async move {
            inner.timeout_loop(interval, shutdown).await;
        }));

        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Worker pool started"
        );
    }

    /// Queue a connection for processing.
    pub fn submit(&self, conn: Connection, event: SocketEvent) -> Result<(), SubmitError> {
        self.inner.submit(conn, event)
    }

    /// Re-dispatch a parked connection. Returns `false` if it is not parked
    /// (already resumed, timed out, or unknown).
    pub fn resume(&self, id: ConnectionId) -> bool {
        let Some((_, parked)) = self.inner.waiting.remove(&id) else {
            return false;
        };
        self.inner.dispatch_claimed(id, parked, SocketEvent::OpenRead);
        true
    }

    /// Run one timeout scan immediately. Returns the number of connections dispatched.
    pub fn scan_timeouts(&self) -> usize {
        self.inner.scan_timeouts(Instant::now())
    }

    /// Number of parked connections.
    pub fn parked(&self) -> usize {
        self.inner.waiting.len()
    }

    /// Whether the connection is currently parked.
    pub fn is_parked(&self, id: ConnectionId) -> bool {
        self.inner.waiting.contains_key(&id)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stop accepting work, let workers finish their current job, close parked connections.
    ///
    /// The caller must have triggered the shutdown signal passed to `start`.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("dispatch task list poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }

        // Dropping a wake handle makes its watcher close the connection.
        let parked: Vec<ConnectionId> = self.inner.waiting.iter().map(|e| *e.key()).collect();
        for id in parked {
            if let Some((_, Parked::Held(conn))) = self.inner.waiting.remove(&id) {
                conn.close().await;
            }
        }

        // Drain anything still queued so permits are released.
        let mut rx = self.inner.rx.lock().await;
        rx.close();
        while let Ok(job) = rx.try_recv() {
            job.conn.close().await;
        }

        tracing::info!("Worker pool stopped");
    }
}

impl<H: ConnectionHandler> DispatchInner<H> {
    fn submit(&self, conn: Connection, event: SocketEvent) -> Result<(), SubmitError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SubmitError::Shutdown(conn));
        }
        self.tx.try_send(Job { conn, event }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => SubmitError::Saturated(job.conn),
            mpsc::error::TrySendError::Closed(job) => SubmitError::Shutdown(job.conn),
        })
    }

    async fn next_job(&self) -> Option<Job> {
        self.rx.lock().await.recv().await
    }

    /// Queue a claimed parked entry with `event`.
    fn dispatch_claimed(&self, id: ConnectionId, parked: Parked, event: SocketEvent) -> bool {
        match parked {
            Parked::Held(conn) => match self.submit(conn, event) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(connection_id = %id, event = ?event, error = %err, "Parked dispatch rejected, closing");
                    drop(err.into_connection());
                    false
                }
            },
            Parked::Watched { wake, .. } => wake.send(event).is_ok(),
        }
    }

    async fn worker_loop(self: &Arc<Self>, worker: usize, mut shutdown: ShutdownSignal) {
        tracing::debug!(worker, "Worker started");
        loop {
            let job = tokio::select! {
                job = self.next_job() => job,
                _ = shutdown.recv() => break,
            };
            let Some(job) = job else { break };

            let mut pass = std::pin::pin!(self.run(job));
            let interrupted = tokio::select! {
                _ = &mut pass => false,
                _ = shutdown.recv() => true,
            };
            if interrupted {
                if tokio::time::timeout(SHUTDOWN_GRACE, pass).await.is_err() {
                    tracing::debug!(worker, "In-flight pass abandoned at shutdown");
                }
                break;
            }
        }
        tracing::debug!(worker, "Worker stopped");
    }

    async fn run(self: &Arc<Self>, job: Job) {
        let Job { mut conn, mut event } = job;
        loop {
            conn.touch();
            let state = self.handler.process(&mut conn, event).await;
            conn.set_state(state);

            match state {
                SocketState::Closed => {
                    conn.close().await;
                    return;
                }
                SocketState::Open | SocketState::Upgrading => {
                    match self.submit(conn, SocketEvent::OpenRead) {
                        Ok(()) => return,
                        Err(SubmitError::Saturated(back)) => {
                            // Queue full: keep the connection on this worker.
                            conn = back;
                            event = SocketEvent::OpenRead;
                        }
                        Err(SubmitError::Shutdown(back)) => {
                            back.close().await;
                            return;
                        }
                    }
                }
                SocketState::Long => {
                    conn.touch();
                    tracing::trace!(connection_id = %conn.id(), "Connection parked until readable");
                    self.watch(conn);
                    return;
                }
                SocketState::AsyncWaiting => {
                    conn.touch();
                    let id = conn.id();
                    tracing::trace!(connection_id = %id, "Connection parked");
                    self.waiting.insert(id, Parked::Held(conn));
                    return;
                }
            }
        }
    }

    /// Park `conn` and re-queue it once its socket turns readable (data or
    /// EOF), unless a resume or timeout claims it first.
    fn watch(self: &Arc<Self>, conn: Connection) {
        let id = conn.id();
        let (wake, mut woken) = oneshot::channel();
        self.waiting.insert(
            id,
            Parked::Watched {
                last_access: conn.last_access(),
                timeout: conn.timeout(),
                wake,
            },
        );

        let inner = self.clone();
        tokio::spawn(async move {
            let mut peek = [0u8; 1];
            let claimed = tokio::select! {
                _ = conn.stream().peek(&mut peek) => None,
                event = &mut woken => Some(event),
            };
            let event = match claimed {
                Some(event) => event,
                None if inner.waiting.remove(&id).is_some() => Ok(SocketEvent::OpenRead),
                // Readable, but a resume or timeout claimed it first.
                None => woken.await,
            };
            match event {
                Ok(event) => inner.requeue(conn, event).await,
                Err(_) => conn.close().await,
            }
        });
    }

    /// Queue a connection from outside a worker, waiting for queue space.
    async fn requeue(&self, conn: Connection, event: SocketEvent) {
        if !self.running.load(Ordering::SeqCst) {
            conn.close().await;
            return;
        }
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job { conn, event }).await {
            job.conn.close().await;
        }
    }

    async fn timeout_loop(&self, interval: Duration, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_timeouts(Instant::now());
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    fn scan_timeouts(&self, now: Instant) -> usize {
        let expired: Vec<ConnectionId> = self
            .waiting
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let mut dispatched = 0;
        for id in expired {
            let Some((_, parked)) = self.waiting.remove(&id) else {
                continue;
            };
            metrics::record_async_timeout();
            tracing::debug!(connection_id = %id, "Parked connection timed out");
            if self.dispatch_claimed(id, parked, SocketEvent::Timeout) {
                dispatched += 1;
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::net::connection::ConnectionSettings;
    use crate::net::latch::AdmissionLatch;
    use std::sync::Mutex as StdMutex;
    use tokio::net::{TcpListener, TcpStream};

    /// Records every dispatch and answers with a scripted state.
    struct Scripted {
        reply: SocketState,
        seen: StdMutex<Vec<(ConnectionId, SocketEvent)>>,
    }

    impl Scripted {
        fn new(reply: SocketState) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<SocketEvent> {
            self.seen.lock().unwrap().iter().map(|(_, e)| *e).collect()
        }
    }

    impl ConnectionHandler for Scripted {
        fn process<'a>(
            &'a self,
            conn: &'a mut Connection,
            event: SocketEvent,
        ) -> BoxFuture<'a, SocketState> {
            Box::pin(async move {
                self.seen.lock().unwrap().push((conn.id(), event));
                match event {
                    SocketEvent::Timeout => SocketState::Closed,
                    SocketEvent::OpenRead => self.reply,
                }
            })
        }
    }

    async fn connection(latch: &Arc<AdmissionLatch>, timeout: Duration) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let settings = ConnectionSettings {
            timeout,
            max_keep_alive_requests: None,
        };
        let permit = latch.try_acquire_owned();
        (Connection::new(server, peer, permit, settings), client)
    }

    fn config(workers: usize, queue_capacity: usize) -> DispatchConfig {
        DispatchConfig {
            workers,
            queue_capacity,
            scan_interval: Duration::from_millis(20),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn rejects_empty_pool() {
        let handler = Scripted::new(SocketState::Closed);
        assert!(matches!(
            WorkerDispatch::new(handler, config(0, 4)),
            Err(DispatchError::NoWorkers)
        ));
    }

    #[tokio::test]
    async fn closed_releases_permit() {
        let latch = Arc::new(AdmissionLatch::new(4));
        let handler = Scripted::new(SocketState::Closed);
        let dispatch = WorkerDispatch::new(handler.clone(), config(2, 8)).unwrap();
        let shutdown = Shutdown::new();
        dispatch.start(shutdown.subscribe());

        let (conn, _client) = connection(&latch, Duration::from_secs(5)).await;
        assert_eq!(latch.count(), 1);
        dispatch.submit(conn, SocketEvent::OpenRead).unwrap();

        eventually(|| latch.count() == 0).await;
        assert_eq!(handler.events(), vec![SocketEvent::OpenRead]);

        shutdown.trigger();
        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn long_connection_times_out_once() {
        let latch = Arc::new(AdmissionLatch::new(4));
        let handler = Scripted::new(SocketState::Long);
        let dispatch = WorkerDispatch::new(handler.clone(), config(1, 8)).unwrap();
        let shutdown = Shutdown::new();
        dispatch.start(shutdown.subscribe());

        let (conn, _client) = connection(&latch, Duration::from_millis(100)).await;
        dispatch.submit(conn, SocketEvent::OpenRead).unwrap();

        eventually(|| dispatch.parked() == 1).await;
        // Parked connections keep their admission slot.
        assert_eq!(latch.count(), 1);

        eventually(|| latch.count() == 0).await;
        assert_eq!(dispatch.parked(), 0);
        assert_eq!(
            handler.events(),
            vec![SocketEvent::OpenRead, SocketEvent::Timeout]
        );

        shutdown.trigger();
        dispatch.shutdown().await;
    }

    /// Drains whatever is buffered and asks to wait for more.
    struct Drain {
        passes: StdMutex<Vec<SocketEvent>>,
    }

    impl ConnectionHandler for Drain {
        fn process<'a>(
            &'a self,
            conn: &'a mut Connection,
            event: SocketEvent,
        ) -> BoxFuture<'a, SocketState> {
            Box::pin(async move {
                self.passes.lock().unwrap().push(event);
                let mut buf = [0u8; 64];
                loop {
                    match conn.stream().try_read(&mut buf) {
                        Ok(0) => return SocketState::Closed,
                        Ok(_) => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return SocketState::Long,
                        Err(_) => return SocketState::Closed,
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn long_connection_wakes_on_input() {
        use tokio::io::AsyncWriteExt;

        let latch = Arc::new(AdmissionLatch::new(4));
        let handler = Arc::new(Drain {
            passes: StdMutex::new(Vec::new()),
        });
        let dispatch = WorkerDispatch::new(handler.clone(), config(1, 8)).unwrap();
        let shutdown = Shutdown::new();
        dispatch.start(shutdown.subscribe());

        let (conn, mut client) = connection(&latch, Duration::from_secs(60)).await;
        let id = conn.id();
        dispatch.submit(conn, SocketEvent::OpenRead).unwrap();
        eventually(|| dispatch.is_parked(id)).await;

        client.write_all(b"more").await.unwrap();
        eventually(|| handler.passes.lock().unwrap().len() == 2).await;
        eventually(|| dispatch.is_parked(id)).await;

        // Peer hangs up: the watcher fires again and the pass closes.
        drop(client);
        eventually(|| latch.count() == 0).await;
        assert_eq!(dispatch.parked(), 0);
        assert_eq!(
            *handler.passes.lock().unwrap(),
            vec![SocketEvent::OpenRead; 3]
        );

        shutdown.trigger();
        dispatch.shutdown().await;
    }

    #[tokio::test]
    async fn resume_wins_over_timeout() {
        let latch = Arc::new(AdmissionLatch::new(4));
        let handler = Scripted::new(SocketState::AsyncWaiting);
        let dispatch = WorkerDispatch::new(handler.clone(), config(1, 8)).unwrap();
        let shutdown = Shutdown::new();
        dispatch.start(shutdown.subscribe());

        let (conn, _client) = connection(&latch, Duration::from_secs(60)).await;
        let id = conn.id();
        dispatch.submit(conn, SocketEvent::OpenRead).unwrap();
        eventually(|| dispatch.is_parked(id)).await;

        assert!(dispatch.resume(id));
        eventually(|| handler.events().len() == 2).await;
        assert_eq!(
            handler.events(),
            vec![SocketEvent::OpenRead, SocketEvent::OpenRead]
        );

        // Parked again after the second pass; a scan finds nothing expired.
        eventually(|| dispatch.is_parked(id)).await;
        assert_eq!(dispatch.scan_timeouts(), 0);

        shutdown.trigger();
        dispatch.shutdown().await;
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn saturated_queue_hands_connection_back() {
        let latch = Arc::new(AdmissionLatch::new(4));
        let handler = Scripted::new(SocketState::Closed);
        // Not started: nothing drains the queue.
        let dispatch = WorkerDispatch::new(handler, config(1, 1)).unwrap();

        let (first, _c1) = connection(&latch, Duration::from_secs(5)).await;
        let (second, _c2) = connection(&latch, Duration::from_secs(5)).await;
        dispatch.submit(first, SocketEvent::OpenRead).unwrap();

        let err = dispatch.submit(second, SocketEvent::OpenRead).unwrap_err();
        assert!(matches!(err, SubmitError::Saturated(_)));
        drop(err.into_connection());
        assert_eq!(latch.count(), 1);

        dispatch.shutdown().await;
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let latch = Arc::new(AdmissionLatch::new(4));
        let handler = Scripted::new(SocketState::Closed);
        let dispatch = WorkerDispatch::new(handler, config(1, 4)).unwrap();
        let shutdown = Shutdown::new();
        dispatch.start(shutdown.subscribe());
        shutdown.trigger();
        dispatch.shutdown().await;

        let (conn, _client) = connection(&latch, Duration::from_secs(5)).await;
        let err = dispatch.submit(conn, SocketEvent::OpenRead).unwrap_err();
        assert!(matches!(err, SubmitError::Shutdown(_)));
    }
}
