//! Background Session Sweeper
//!
//! Sessions are only touched when a request presents their cookie. A client
//! that never comes back would leave its session in the store forever, so a
//! background task periodically removes sessions idle for longer than the
//! session timeout.

use crate::session::store::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Configuration for the session sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps (default: 60s)
    pub interval: Duration,

    /// Sessions idle longer than this are removed (default: 20 minutes)
    pub max_idle: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(20 * 60),
        }
    }
}

/// A handle to the running session sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct SessionSweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl SessionSweeper {
    /// Starts the sweeper as a background task on the current runtime.
    pub fn start(store: Arc<dyn SessionStore>, config: SweeperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(store, config, shutdown_rx));

        info!("Session sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Session sweeper stopped");
        }
    }
}

impl Drop for SessionSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop(
    store: Arc<dyn SessionStore>,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        // Wait for the interval or shutdown signal
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Session sweeper received shutdown signal");
                    return;
                }
            }
        }

        let removed = store.cleanup(config.max_idle);
        if removed > 0 {
            debug!(removed = removed, "Idle sessions cleaned up");
        }
    }
}
