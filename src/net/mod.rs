//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → latch.rs (admission: wait for a free slot)
//!     → acceptor.rs (accept loop, backoff on errors)
//!     → listener.rs (socket options via SocketConfigurator)
//!     → connection.rs (slot: permit, keep-alive, timeout, state)
//!     → dispatch.rs (worker pool → ConnectionHandler::process)
//!
//! Processing result:
//!     Open/Upgrading → re-queued
//!     Long/AsyncWaiting → parked, timeout scanner
//!     Closed → socket closed, admission released
//! ```
//!
//! # Design Decisions
//! - Admission is taken before accept; overload shows up as latency, not refusal
//! - endpoint.rs owns every task and stops them in order
//! - Each connection tracked for graceful shutdown

pub mod acceptor;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod latch;
pub mod listener;

pub use acceptor::{AcceptorHandle, AcceptorState};
pub use connection::{Connection, ConnectionId, ConnectionSettings, SocketEvent, SocketState};
pub use dispatch::{ConnectionHandler, SubmitError, WorkerDispatch};
pub use endpoint::{Endpoint, EndpointError};
pub use latch::{AdmissionError, AdmissionLatch, AdmissionPermit};
pub use listener::{SocketConfigurator, SocketProperties};
