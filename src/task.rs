//! Cancellable periodic background tasks.
//!
//! Both the TTL sweeper and the AOF flush ticker are a closure run on a
//! fixed interval until shutdown. [`PeriodicTask`] owns the spawned loop
//! and its stop signal; [`PeriodicTask::stop`] signals the loop and waits
//! for it to finish, so callers can release resources (close files) knowing
//! the tick cannot fire again. Ticks that touch the disk go through
//! [`PeriodicTask::spawn_blocking`] so they never stall a runtime thread.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A handle to a running periodic task.
///
/// Dropping the handle signals the task to stop without waiting for it.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns `tick` to run every `interval` on the current Tokio runtime.
    ///
    /// The first tick fires one interval after spawning.
    pub fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn_loop(name, interval, move || {
            tick();
            std::future::ready(())
        })
    }

    /// Like [`PeriodicTask::spawn`], but each tick runs on Tokio's blocking
    /// thread pool. Use it for ticks that do file I/O.
    ///
    /// Ticks never overlap, and [`PeriodicTask::stop`] waits for a tick in
    /// progress.
    pub fn spawn_blocking<F>(name: &'static str, interval: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let tick = Arc::new(tick);

        Self::spawn_loop(name, interval, move || {
            let tick = Arc::clone(&tick);
            async move {
                if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                    warn!(task = name, error = %e, "Blocking tick failed");
                }
            }
        })
    }

    fn spawn_loop<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            debug!(task = name, "Periodic task received shutdown signal");
                            return;
                        }
                    }
                }

                tick().await;
            }
        });

        debug!(task = name, interval_ms = interval.as_millis() as u64, "Periodic task started");

        Self {
            name,
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Name given at spawn time.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the task to stop and waits until its loop has exited.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Periodic task ended abnormally");
            }
        }

        debug!(task = self.name, "Periodic task stopped");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
