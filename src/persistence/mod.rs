//! Persistence Module
//!
//! Every acknowledged write must survive a clean restart. Two strategies
//! provide that, plus a no-op one for when durability is switched off:
//!
//! | Strategy  | Records writes | On `FLUSHALL`     | On shutdown      | On boot             |
//! |-----------|----------------|-------------------|------------------|---------------------|
//! | AOF       | buffered lines | truncate the log  | final flush      | replay the commands |
//! | Snapshot  | no             | empty the file    | dump every item  | load every item     |
//! | None      | no             | nothing           | nothing          | nothing             |
//!
//! The dispatcher only talks to the [`Persistor`] trait, so it does not know
//! which strategy is active.
//!
//! ## Write-behind
//!
//! The AOF appends to an in-memory buffer on the request path; a periodic
//! task flushes the buffer to disk. A failed flush is logged by the caller
//! and retried on the next tick. It never turns a client's `OK` into an
//! error.

pub mod aof;
pub mod line;
pub mod snapshot;

pub use aof::AofPersistor;
pub use snapshot::SnapshotPersistor;

use crate::error::Result;
use crate::storage::{Item, KeyValueStore};
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which persistence strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PersistenceMode {
    /// Keep everything in memory only
    None,
    /// Append-only command log
    #[default]
    Aof,
    /// Full dump on shutdown, load on boot
    Snapshot,
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PersistenceMode::None => "none",
            PersistenceMode::Aof => "aof",
            PersistenceMode::Snapshot => "snapshot",
        })
    }
}

impl FromStr for PersistenceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(PersistenceMode::None),
            "aof" => Ok(PersistenceMode::Aof),
            "snapshot" => Ok(PersistenceMode::Snapshot),
            other => Err(format!("unknown persistence mode '{}'", other)),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub mode: PersistenceMode,
    pub aof_path: PathBuf,
    pub aof_flush_interval: Duration,
    pub snapshot_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mode: PersistenceMode::default(),
            aof_path: PathBuf::from(aof::DEFAULT_AOF_FILE),
            aof_flush_interval: aof::DEFAULT_FLUSH_INTERVAL,
            snapshot_path: PathBuf::from(snapshot::DEFAULT_SNAPSHOT_FILE),
        }
    }
}

/// A lazily read sequence of logged commands.
pub type CommandLog = Box<dyn Iterator<Item = Result<Vec<Bytes>>> + Send>;

/// State recovered at boot.
pub enum Recovery {
    /// Nothing was persisted
    Nothing,
    /// Items to store directly
    Items(Vec<Item>),
    /// Commands to replay through the normal handlers, in log order
    Commands(CommandLog),
}

impl fmt::Debug for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::Nothing => f.write_str("Nothing"),
            Recovery::Items(items) => f.debug_tuple("Items").field(&items.len()).finish(),
            Recovery::Commands(_) => f.write_str("Commands(..)"),
        }
    }
}

/// A persistence strategy.
pub trait Persistor: Send + Sync + fmt::Debug {
    /// Short name used in logs and `INFO`.
    fn name(&self) -> &'static str;

    /// Records a successfully executed write command.
    ///
    /// Must not block on disk I/O.
    fn record(&self, argv: &[Bytes]);

    /// Makes everything recorded so far durable.
    fn flush(&self) -> Result<()>;

    /// Discards all persisted state.
    fn truncate(&self) -> Result<()>;

    /// Reads persisted state for recovery at boot.
    fn load(&self) -> Result<Recovery>;

    /// Persists the whole store.
    fn save(&self, store: &KeyValueStore) -> Result<()>;

    /// Flushes and syncs before the process exits.
    fn close(&self) -> Result<()>;

    /// How often [`Persistor::flush`] should be called, if at all.
    fn flush_interval(&self) -> Option<Duration> {
        None
    }
}

/// Persistence switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistor;

impl Persistor for NoopPersistor {
    fn name(&self) -> &'static str {
        "none"
    }

    fn record(&self, _argv: &[Bytes]) {}

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<Recovery> {
        Ok(Recovery::Nothing)
    }

    fn save(&self, _store: &KeyValueStore) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the persistor selected by `config`.
///
/// Failing to open the backing file is an error the caller should treat as
/// fatal.
pub fn open(config: &PersistenceConfig) -> Result<Arc<dyn Persistor>> {
    Ok(match config.mode {
        PersistenceMode::None => Arc::new(NoopPersistor),
        PersistenceMode::Aof => Arc::new(AofPersistor::open(
            &config.aof_path,
            config.aof_flush_interval,
        )?),
        PersistenceMode::Snapshot => Arc::new(SnapshotPersistor::open(&config.snapshot_path)?),
    })
}
