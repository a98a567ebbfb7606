//! Configuration file watcher for hot reload.
//!
//! Editors often emit several modify events for one save. Only loads whose
//! result differs from the last configuration handed out are forwarded.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::NodeConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches one configuration file and forwards validated changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<NodeConfig>,
    last: Mutex<Option<NodeConfig>>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<NodeConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            update_tx,
            last: Mutex::new(load_config(path).ok()),
        };
        (watcher, update_rx)
    }

    /// Reload the file and forward it if it changed. Returns whether an
    /// update was sent.
    pub fn reload(&self) -> bool {
        let next = match load_config(&self.path) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Failed to reload config, keeping current configuration");
                return false;
            }
        };

        let mut last = self.last.lock().expect("config watcher state poisoned");
        if last.as_ref() == Some(&next) {
            tracing::debug!(path = ?self.path, "Config file touched without changes");
            return false;
        }
        *last = Some(next.clone());
        self.update_tx.send(next).is_ok()
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    tracing::info!(path = ?self.path, "Config file change detected");
                    self.reload();
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
