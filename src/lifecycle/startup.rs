//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Build the configured interceptor chain
//! - Start the group channel (endpoint, membership, heartbeats)
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and leaves nothing running
//! - Interceptor order is fixed: statistics sits above compression so it
//!   counts application-sized payloads

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::channel::{
    ChannelBuilder, ChannelListener, CompressionInterceptor, GroupChannel, StartError,
    StatisticsInterceptor,
};
use crate::config::{validate_config, NodeConfig, ValidationError};
use crate::membership::MembershipListener;

/// Why the node failed to start.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {}", join(.0))]
    Config(Vec<ValidationError>),
    #[error(transparent)]
    Channel(#[from] StartError),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Channel builder with the interceptors `config` asks for.
pub fn channel_builder(config: NodeConfig) -> Result<ChannelBuilder, StartupError> {
    validate_config(&config).map_err(StartupError::Config)?;

    let interceptors = config.interceptors.clone();
    let max_frame = config.sender.max_frame_bytes;
    let mut builder = GroupChannel::builder(config);

    if interceptors.statistics {
        builder = builder.interceptor(Arc::new(StatisticsInterceptor::new(Duration::from_secs(
            interceptors.statistics_report_secs,
        ))));
    }
    if interceptors.compression {
        builder = builder.interceptor(Arc::new(CompressionInterceptor::new(
            interceptors.compression_level,
            max_frame,
        )));
    }
    Ok(builder)
}

/// Validate, assemble and start a node.
pub async fn start_node(
    config: NodeConfig,
    listeners: Vec<Arc<dyn ChannelListener>>,
    membership_listeners: Vec<Arc<dyn MembershipListener>>,
) -> Result<GroupChannel, StartupError> {
    let mut builder = channel_builder(config)?;
    for listener in listeners {
        builder = builder.listener(listener);
    }
    for listener in membership_listeners {
        builder = builder.membership_listener(listener);
    }
    Ok(builder.start().await?)
}
