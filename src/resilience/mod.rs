//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop error:
//!     → backoff.rs (Backoff::next_delay, reset on success)
//!
//! Multi-destination send fault:
//!     → retries.rs (RetryPolicy: attempts + spacing)
//!     → backoff.rs (jittered delay between rounds)
//! ```
//!
//! # Design Decisions
//! - Every wait is bounded (max delay caps)
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod retries;
