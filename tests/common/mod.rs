//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_node::channel::{ChannelListener, ChannelMessage, ProcessingError};
use cluster_node::config::NodeConfig;
use cluster_node::membership::{Member, MembershipListener};

/// Node config bound to ephemeral loopback ports with fast heartbeats.
pub fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.connector.bind_address = "127.0.0.1:0".into();
    config.connector.worker_threads = 4;
    config.membership.bind_address = "127.0.0.1:0".into();
    config.membership.heartbeat_interval_ms = 50;
    config.membership.expiration_ms = 400;
    config.sender.ack_timeout_ms = 500;
    config.sender.connect_timeout_ms = 500;
    config.sender.retry_base_delay_ms = 10;
    config.sender.retry_max_delay_ms = 50;
    config.interceptors.statistics = false;
    config
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Run `f` with a deadline so a hung test fails instead of stalling.
pub async fn within<T>(limit: Duration, f: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, f).await.expect("timed out")
}

/// Records received payloads; optionally fails processing.
#[derive(Default)]
pub struct Inbox {
    pub fail_with: Option<String>,
    pub payloads: Mutex<Vec<Vec<u8>>>,
}

impl Inbox {
    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(reason.to_string()),
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.payloads.lock().unwrap().clone()
    }
}

impl ChannelListener for Inbox {
    fn message_received(&self, msg: &ChannelMessage) -> Result<(), ProcessingError> {
        self.payloads.lock().unwrap().push(msg.payload().to_vec());
        match &self.fail_with {
            Some(reason) => Err(ProcessingError::new(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Records membership notifications.
#[derive(Default)]
pub struct MemberLog {
    pub added: Mutex<Vec<Member>>,
    pub gone: Mutex<Vec<Member>>,
}

impl MembershipListener for MemberLog {
    fn member_added(&self, member: &Member) {
        self.added.lock().unwrap().push(member.clone());
    }

    fn member_disappeared(&self, member: &Member) {
        self.gone.lock().unwrap().push(member.clone());
    }
}
