//! TCP server lifecycle.
//!
//! [`Server::bind`] opens persistence, recovers the keyspace, starts the
//! background tasks and binds the listener. [`Server::run_until`] accepts
//! connections until the shutdown future resolves and then tears things
//! down in order:
//!
//! 1. stop accepting and close every client
//! 2. stop the expiry sweeper and the AOF flush ticker
//! 3. drain the worker pool
//! 4. save (snapshot) or flush (AOF), then close the persistor

use crate::commands::pool::default_workers;
use crate::commands::Dispatcher;
use crate::connection::{handle_connection, ConnectionStats};
use crate::error::{Error, Result};
use crate::persistence::{self, PersistenceConfig, Persistor};
use crate::storage::{ExpiryConfig, ExpirySweeper, KeyValueStore, TableConfig};
use crate::task::PeriodicTask;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How long closed connections get to finish their in-flight command.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a server needs to boot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub table: TableConfig,
    pub expiry: ExpiryConfig,
    pub persistence: PersistenceConfig,
    /// Reported by `CONFIG GET`
    pub settings: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            workers: default_workers(),
            table: TableConfig::default(),
            expiry: ExpiryConfig::default(),
            persistence: PersistenceConfig::default(),
            settings: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A bound, ready-to-run server.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<ConnectionStats>,
    sweeper: ExpirySweeper,
    flusher: Option<PeriodicTask>,
}

impl Server {
    /// Boots every component and binds the listener.
    ///
    /// Failing to open the persistence file, to recover from it, or to bind
    /// the address is fatal.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let persistor = persistence::open(&config.persistence)?;
        info!(strategy = persistor.name(), "Persistence opened");

        let store = Arc::new(KeyValueStore::with_config(config.table));
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&persistor), config.workers)
            .map_err(Error::Workers)?
            .with_settings(config.settings.clone());
        let dispatcher = Arc::new(dispatcher);

        dispatcher.restore(persistor.load()?)?;
        info!(
            keys = store.len(),
            buckets = config.table.initial_buckets,
            workers = config.workers,
            "Keyspace ready"
        );

        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind { addr: addr.clone(), source })?;
        info!("Listening on {}", addr);

        let sweeper = ExpirySweeper::start(Arc::clone(&store), config.expiry.clone());
        let flusher = persistor
            .flush_interval()
            .map(|interval| spawn_flusher(Arc::clone(&persistor), interval));

        Ok(Self {
            listener,
            dispatcher,
            stats: Arc::new(ConnectionStats::new()),
            sweeper,
            flusher,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Serves connections until `shutdown` resolves, then shuts down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            dispatcher,
            stats,
            sweeper,
            flusher,
        } = self;

        let mut connections = JoinSet::new();

        tokio::select! {
            _ = accept_loop(&listener, &dispatcher, &stats, &mut connections) => {}
            _ = shutdown => {
                info!("Shutdown signal received, stopping server...");
            }
        }
        drop(listener);

        dispatcher.clients().close_all();
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections did not close in time, aborting them"
            );
            connections.shutdown().await;
        }

        sweeper.stop().await;
        if let Some(flusher) = flusher {
            flusher.stop().await;
        }

        let finish = tokio::task::spawn_blocking(move || {
            dispatcher.shutdown();
            let persistor = dispatcher.persistor();
            persistor.save(dispatcher.store())?;
            persistor.close()
        });

        match finish.await {
            Ok(Ok(())) => {
                info!("Server shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to persist data during shutdown");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "Shutdown task panicked");
                Ok(())
            }
        }
    }
}

/// Accepts connections forever, one task each.
async fn accept_loop(
    listener: &TcpListener,
    dispatcher: &Arc<Dispatcher>,
    stats: &Arc<ConnectionStats>,
    connections: &mut JoinSet<()>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                while connections.try_join_next().is_some() {}

                connections.spawn(handle_connection(
                    stream,
                    addr,
                    Arc::clone(dispatcher),
                    Arc::clone(stats),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Flushes buffered AOF writes on a fixed interval, on the blocking pool.
///
/// A failed flush keeps the buffer and is retried on the next tick.
fn spawn_flusher(persistor: Arc<dyn Persistor>, interval: Duration) -> PeriodicTask {
    PeriodicTask::spawn_blocking("aof-flush", interval, move || {
        if let Err(e) = persistor.flush() {
            error!(error = %e, "Failed to flush append-only log");
        }
    })
}
