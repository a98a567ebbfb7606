//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to internal events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP triggers config reload, not shutdown

/// What the daemon should do in response to an OS signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    Reload,
}

/// Wait for the next actionable signal.
#[cfg(unix)]
pub async fn next_signal() -> std::io::Result<SignalAction> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("SIGINT received");
            Ok(SignalAction::Shutdown)
        }
        _ = terminate.recv() => {
            tracing::info!("SIGTERM received");
            Ok(SignalAction::Shutdown)
        }
        _ = hangup.recv() => {
            tracing::info!("SIGHUP received");
            Ok(SignalAction::Reload)
        }
    }
}

/// Wait for the next actionable signal.
#[cfg(not(unix))]
pub async fn next_signal() -> std::io::Result<SignalAction> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received");
    Ok(SignalAction::Shutdown)
}
