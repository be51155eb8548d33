//! Background Expiry Sweeper
//!
//! Lazy expiry only removes a dead key when somebody reads it. A key that
//! expires and is never touched again would stay in memory forever, so the
//! sweeper periodically asks the store to drop every expired item.
//!
//! The sweep runs on a [`PeriodicTask`]: a fixed interval (1 second by
//! default) and a stop signal that is joined during shutdown.

use crate::storage::KeyValueStore;
use crate::task::PeriodicTask;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval between sweeps
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A handle to the running expiry sweeper.
#[derive(Debug)]
pub struct ExpirySweeper {
    task: PeriodicTask,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background Tokio task.
    ///
    /// Dropping the handle stops the sweeper; [`ExpirySweeper::stop`] also
    /// waits for an in-progress sweep to finish.
    pub fn start(store: Arc<KeyValueStore>, config: ExpiryConfig) -> Self {
        let task = PeriodicTask::spawn("expiry-sweeper", config.interval, move || {
            let expired = store.cleanup_expired();
            if expired > 0 {
                debug!(
                    expired = expired,
                    keys_remaining = store.len(),
                    "Expired keys cleaned up"
                );
            }
        });

        info!(
            interval_ms = config.interval.as_millis() as u64,
            "Background expiry sweeper started"
        );

        Self { task }
    }

    /// Stops the sweeper and waits for it to exit.
    pub async fn stop(self) {
        self.task.stop().await;
        info!("Background expiry sweeper stopped");
    }
}
