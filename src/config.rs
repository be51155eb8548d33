//! Server configuration.
//!
//! Every tunable is a command-line flag with a `KVSTORE_*` environment
//! fallback. [`Config`] is only the parsed surface; components receive the
//! typed structs built from it ([`TableConfig`], [`ExpiryConfig`],
//! [`PersistenceConfig`], [`ServerConfig`]).

use crate::commands::pool::default_workers;
use crate::error::{Error, Result};
use crate::persistence::{aof, snapshot, PersistenceConfig, PersistenceMode};
use crate::server::ServerConfig;
use crate::storage::expiry::ExpiryConfig;
use crate::storage::hashtable::{TableConfig, DEFAULT_BUCKETS, MAX_LOAD_FACTOR, MIN_LOAD_FACTOR};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "kvstore-server", author, version, about, long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_HOST, env = "KVSTORE_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "KVSTORE_PORT")]
    pub port: u16,

    /// Worker threads executing commands (defaults to the number of CPUs)
    #[arg(long, env = "KVSTORE_WORKERS")]
    pub workers: Option<usize>,

    /// Initial bucket count of the hash table
    #[arg(long, default_value_t = DEFAULT_BUCKETS, env = "KVSTORE_BUCKETS")]
    pub buckets: usize,

    /// Load factor below which the table shrinks
    #[arg(long, default_value_t = MIN_LOAD_FACTOR, env = "KVSTORE_MIN_LOAD_FACTOR")]
    pub min_load_factor: f64,

    /// Load factor above which the table grows
    #[arg(long, default_value_t = MAX_LOAD_FACTOR, env = "KVSTORE_MAX_LOAD_FACTOR")]
    pub max_load_factor: f64,

    /// Milliseconds between active expiry sweeps
    #[arg(long, default_value_t = 1000, env = "KVSTORE_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,

    /// Persistence strategy
    #[arg(long, value_enum, default_value_t = PersistenceMode::Aof, env = "KVSTORE_PERSISTENCE")]
    pub persistence: PersistenceMode,

    /// Append-only log file
    #[arg(long, default_value = aof::DEFAULT_AOF_FILE, env = "KVSTORE_AOF_PATH")]
    pub aof_path: PathBuf,

    /// Milliseconds between append-only log flushes
    #[arg(long, default_value_t = 1000, env = "KVSTORE_AOF_FLUSH_MS")]
    pub aof_flush_ms: u64,

    /// Snapshot file
    #[arg(long, default_value = snapshot::DEFAULT_SNAPSHOT_FILE, env = "KVSTORE_SNAPSHOT_PATH")]
    pub snapshot_path: PathBuf,

    /// Log filter, e.g. `info` or `kvstore=debug`
    #[arg(long, default_value = "info", env = "KVSTORE_LOG")]
    pub log_level: String,
}

impl Config {
    /// Rejects combinations the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(Error::Config("buckets must be greater than 0".into()));
        }
        if !(self.min_load_factor >= 0.0 && self.min_load_factor < self.max_load_factor) {
            return Err(Error::Config(format!(
                "min-load-factor ({}) must be at least 0 and below max-load-factor ({})",
                self.min_load_factor, self.max_load_factor
            )));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep-interval-ms must be greater than 0".into()));
        }
        if self.aof_flush_ms == 0 {
            return Err(Error::Config("aof-flush-ms must be greater than 0".into()));
        }
        if self.workers == Some(0) {
            return Err(Error::Config("workers must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }

    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            initial_buckets: self.buckets,
            min_load_factor: self.min_load_factor,
            max_load_factor: self.max_load_factor,
        }
    }

    pub fn expiry_config(&self) -> ExpiryConfig {
        ExpiryConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            mode: self.persistence,
            aof_path: self.aof_path.clone(),
            aof_flush_interval: Duration::from_millis(self.aof_flush_ms),
            snapshot_path: self.snapshot_path.clone(),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            workers: self.worker_count(),
            table: self.table_config(),
            expiry: self.expiry_config(),
            persistence: self.persistence_config(),
            settings: self.settings(),
        }
    }

    /// All tunables keyed by dotted name, as reported by `CONFIG GET`.
    pub fn settings(&self) -> BTreeMap<String, String> {
        let pairs = [
            ("server.host", self.host.clone()),
            ("server.port", self.port.to_string()),
            ("server.workers", self.worker_count().to_string()),
            ("hashtable.buckets", self.buckets.to_string()),
            ("hashtable.min_load_factor", self.min_load_factor.to_string()),
            ("hashtable.max_load_factor", self.max_load_factor.to_string()),
            ("expiry.sweep_interval_ms", self.sweep_interval_ms.to_string()),
            ("persistence.mode", self.persistence.to_string()),
            ("aof.path", self.aof_path.display().to_string()),
            ("aof.flush_interval_ms", self.aof_flush_ms.to_string()),
            ("snapshot.path", self.snapshot_path.display().to_string()),
            ("log.level", self.log_level.clone()),
        ];

        pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }

    /// Looks up a single tunable by dotted name.
    pub fn get(&self, key: &str) -> Option<String> {
        self.settings().remove(key)
    }
}
