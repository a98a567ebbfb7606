//! Cluster node daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                     CLUSTER NODE                     │
//!                      │                                                      │
//!   peer frames ───────┼─▶ acceptor ─▶ admission ─▶ worker ─▶ receiver ──┐    │
//!     (TCP)            │   (net)        latch       dispatch   (channel) │    │
//!                      │                                                ▼    │
//!                      │                                   interceptor chain  │
//!                      │                                        │      ▲      │
//!                      │                               listeners ◀┘      │      │
//!                      │                                                │      │
//!   application ───────┼─▶ GroupChannel::send ─▶ chain ─▶ reliable sender ─────┼──▶ peers
//!                      │                                                      │
//!   heartbeats ◀───────┼─▶ membership service (UDP) ─▶ membership table      │
//!     (UDP)            │                                                      │
//!                      │  config · lifecycle · observability · resilience     │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use arc_swap::ArcSwap;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use cluster_node::config::{load_config, watcher::ConfigWatcher, NodeConfig};
use cluster_node::lifecycle::signals::{next_signal, SignalAction};
use cluster_node::lifecycle::startup::start_node;
use cluster_node::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "cluster-node")]
#[command(about = "Cluster node with heartbeat membership and reliable messaging", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Message endpoint bind address (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Heartbeat socket bind address (overrides config)
    #[arg(long)]
    membership_bind: Option<String>,

    /// Seed peer heartbeat address; repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Admission limit (overrides config)
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(bind) = &self.bind {
            config.connector.bind_address = bind.clone();
        }
        if let Some(bind) = &self.membership_bind {
            config.membership.bind_address = bind.clone();
        }
        config.membership.peers.extend(self.peers.iter().cloned());
        if let Some(max) = self.max_connections {
            config.connector.max_connections = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };
    args.apply(&mut config);

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cluster-node starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let live = ArcSwap::from_pointee(config.clone());
    let channel = start_node(config, Vec::new(), Vec::new()).await?;
    tracing::info!(
        member = %channel.local_member(),
        endpoint = %channel.endpoint().local_addr(),
        "Node running"
    );

    let (mut updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(handle) => (Some(rx), Some(handle)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    loop {
        tokio::select! {
            signal = next_signal() => match signal {
                Ok(SignalAction::Shutdown) => break,
                Ok(SignalAction::Reload) => {
                    let Some(path) = &args.config else {
                        tracing::info!("Reload requested without a config file, ignoring");
                        continue;
                    };
                    match load_config(path) {
                        Ok(mut next) => {
                            args.apply(&mut next);
                            apply_reload(&live, next, &channel);
                        }
                        Err(e) => tracing::error!(error = %e, "Reload failed, keeping current config"),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Signal handling failed, shutting down");
                    break;
                }
            },
            Some(mut next) = recv_update(&mut updates) => {
                args.apply(&mut next);
                apply_reload(&live, next, &channel);
            }
        }
    }

    channel.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn recv_update(
    updates: &mut Option<tokio::sync::mpsc::UnboundedReceiver<NodeConfig>>,
) -> Option<NodeConfig> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Apply the settings that can change without a restart.
fn apply_reload(live: &ArcSwap<NodeConfig>, next: NodeConfig, channel: &cluster_node::GroupChannel) {
    let current = live.load();
    if next.connector.max_connections != current.connector.max_connections {
        channel.endpoint().set_max_connections(next.connector.max_connections);
    }
    if next.connector.bind_address != current.connector.bind_address
        || next.membership != current.membership
        || next.sender != current.sender
    {
        tracing::warn!("Listener, membership and sender changes take effect after restart");
    }
    live.store(Arc::new(next));
    tracing::info!("Configuration reloaded");
}
