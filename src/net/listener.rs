//! Listening socket setup and per-connection socket options.
//!
//! # Responsibilities
//! - Bind to the configured address with backlog and buffer sizes
//! - Apply socket options to every accepted connection
//!
//! # Design Decisions
//! - Buffer sizes and SO_KEEPALIVE are set on the listening socket so that
//!   accepted sockets inherit them
//! - Per-connection options go through [`SocketConfigurator`] so embedders
//!   can substitute their own policy

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::ConnectorConfig;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configured address did not parse.
    #[error("Invalid bind address {0:?}")]
    Address(String),
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(#[source] io::Error),
}

/// Bind the listening socket described by `config`.
pub fn bind_listener(config: &ConnectorConfig) -> Result<TcpListener, ListenerError> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|_| ListenerError::Address(config.bind_address.clone()))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(ListenerError::Bind)?;

    socket.set_reuseaddr(true).map_err(ListenerError::Bind)?;
    socket.set_keepalive(config.keep_alive).map_err(ListenerError::Bind)?;
    if let Some(size) = config.recv_buffer_size {
        socket.set_recv_buffer_size(size).map_err(ListenerError::Bind)?;
    }
    if let Some(size) = config.send_buffer_size {
        socket.set_send_buffer_size(size).map_err(ListenerError::Bind)?;
    }
    socket.bind(addr).map_err(ListenerError::Bind)?;
    let listener = socket.listen(config.backlog).map_err(ListenerError::Bind)?;

    let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
    tracing::info!(
        address = %local_addr,
        backlog = config.backlog,
        max_connections = config.max_connections,
        "Listener bound"
    );

    Ok(listener)
}

/// Callback applied to every accepted socket before it is dispatched.
pub trait SocketConfigurator: Send + Sync + 'static {
    fn configure(&self, stream: &TcpStream) -> io::Result<()>;
}

/// Socket options taken from the connector configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketProperties {
    pub tcp_no_delay: bool,
    pub so_linger: Option<Duration>,
}

impl SocketProperties {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            tcp_no_delay: config.tcp_no_delay,
            so_linger: config.so_linger_secs.map(Duration::from_secs),
        }
    }
}

impl Default for SocketProperties {
    fn default() -> Self {
        Self::from_config(&ConnectorConfig::default())
    }
}

impl SocketConfigurator for SocketProperties {
    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_no_delay)?;
        if self.so_linger.is_some() {
            stream.set_linger(self.so_linger)?;
        }
        Ok(())
    }
}
