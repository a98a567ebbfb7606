//! Connector endpoint: listener + admission latch + worker pool + accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ConnectorConfig;
use crate::lifecycle::Shutdown;
use crate::net::acceptor::{Acceptor, AcceptorHandle, AcceptorState};
use crate::net::connection::{ConnectionId, ConnectionSettings};
use crate::net::dispatch::{ConnectionHandler, DispatchConfig, DispatchError, WorkerDispatch};
use crate::net::latch::AdmissionLatch;
use crate::net::listener::{bind_listener, ListenerError, SocketConfigurator, SocketProperties};
use crate::resilience::backoff::Backoff;

/// Fatal endpoint startup errors.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("Failed to create worker pool: {0}")]
    Dispatch(#[from] DispatchError),
}

/// A running connector.
///
/// Owns every task it spawns; [`Endpoint::stop`] tears them all down.
pub struct Endpoint<H> {
    local_addr: SocketAddr,
    latch: Arc<AdmissionLatch>,
    dispatch: Arc<WorkerDispatch<H>>,
    acceptor: AcceptorHandle,
    shutdown: Shutdown,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<H: ConnectionHandler> Endpoint<H> {
    /// Bind and start with the default socket options from `config`.
    pub fn start(config: &ConnectorConfig, handler: Arc<H>) -> Result<Self, EndpointError> {
        Self::start_with(config, handler, Arc::new(SocketProperties::from_config(config)))
    }

    /// Bind and start with a caller-supplied socket configurator.
    ///
    /// Nothing is left running if this fails.
    pub fn start_with(
        config: &ConnectorConfig,
        handler: Arc<H>,
        configurator: Arc<dyn SocketConfigurator>,
    ) -> Result<Self, EndpointError> {
        let dispatch = Arc::new(WorkerDispatch::new(
            handler,
            DispatchConfig {
                workers: config.worker_threads,
                queue_capacity: config.queue_capacity,
                scan_interval: config.timeout_scan_interval(),
            },
        )?);
        let listener = bind_listener(config)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        let latch = Arc::new(AdmissionLatch::new(config.max_connections));
        let shutdown = Shutdown::new();

        let acceptor = Acceptor::new(
            listener,
            latch.clone(),
            dispatch.clone(),
            configurator,
            ConnectionSettings {
                timeout: config.connection_timeout(),
                max_keep_alive_requests: config.max_keep_alive_requests,
            },
            Backoff::new(config.accept_backoff_base_ms, config.accept_backoff_max_ms),
        );
        let handle = acceptor.handle();

        dispatch.start(shutdown.subscribe());
        let signal = shutdown.subscribe();
        let accept_task = tokio::spawn(acceptor.run(signal));

        Ok(Self {
            local_addr,
            latch,
            dispatch,
            acceptor: handle,
            shutdown,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Admitted connections right now.
    pub fn connection_count(&self) -> usize {
        self.latch.count()
    }

    pub fn max_connections(&self) -> usize {
        self.latch.limit()
    }

    /// Change the admission limit without restarting.
    pub fn set_max_connections(&self, limit: usize) {
        self.latch.set_limit(limit);
        tracing::info!(max_connections = limit, "Admission limit updated");
    }

    pub fn pause(&self) {
        self.acceptor.pause();
        tracing::info!(address = %self.local_addr, "Accept loop paused");
    }

    pub fn resume(&self) {
        self.acceptor.resume();
        tracing::info!(address = %self.local_addr, "Accept loop resumed");
    }

    pub fn acceptor_state(&self) -> AcceptorState {
        self.acceptor.state()
    }

    /// Resume a connection parked by its handler.
    pub fn resume_connection(&self, id: ConnectionId) -> bool {
        self.dispatch.resume(id)
    }

    pub fn dispatch(&self) -> &Arc<WorkerDispatch<H>> {
        &self.dispatch
    }

    pub fn latch(&self) -> &Arc<AdmissionLatch> {
        &self.latch
    }

    /// Stop accepting, open the latch, stop workers, close parked connections.
    pub async fn stop(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        tracing::info!(address = %self.local_addr, "Stopping endpoint");

        self.acceptor.end();
        self.shutdown.trigger();
        self.latch.release_all();

        let task = self
            .accept_task
            .lock()
            .expect("accept task slot poisoned")
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Accept task failed");
            }
        }

        self.dispatch.shutdown().await;
        tracing::info!(address = %self.local_addr, "Endpoint stopped");
    }
}
