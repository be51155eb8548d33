//! # kvstore - An In-Memory Key-Value Server
//!
//! kvstore keeps byte-string keys and values in a hand-built hash table,
//! supports per-key expiry, speaks a RESP-like protocol over TCP and keeps
//! data across restarts with an append-only log or a snapshot file.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                               kvstore                               │
//! │                                                                     │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐                │
//! │  │   Server    │──>│ Connection  │──>│ Dispatcher  │──> WorkerPool  │
//! │  │ (Listener)  │   │  Handler    │   │ (commands)  │                │
//! │  └─────────────┘   └──────┬──────┘   └──────┬──────┘                │
//! │                           │                 │                       │
//! │                    ┌──────▼──────┐   ┌──────▼──────────────────┐    │
//! │                    │ RESP Parser │   │      KeyValueStore      │    │
//! │                    └─────────────┘   │  RwLock<HashTable<Item>>│    │
//! │                                      └──────▲──────────────────┘    │
//! │                                             │                       │
//! │          ┌──────────────────┐        ┌──────┴───────┐               │
//! │          │    Persistor     │        │ExpirySweeper │               │
//! │          │ AOF | Snapshot   │        │ (background) │               │
//! │          └──────────────────┘        └──────────────┘               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvstore::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> kvstore::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `GET`, `SET` (`EX`/`PX`, `NX`/`XX`), `SETEX`, `DEL`, `KEYS`
//! - `EXPIRE`, `PEXPIRE`, `TTL`, `PTTL`
//! - `FLUSHALL`, `PING`, `INFO`, `COMMAND`, `CONFIG GET`
//! - `CLIENT ID | INFO | LIST | KILL | SETNAME | GETNAME`
//!
//! ## Module Overview
//!
//! - [`storage`]: hash table, TTL store, glob matching and the expiry sweeper
//! - [`protocol`]: RESP-like values and parser, TLV codec
//! - [`persistence`]: append-only log, snapshot and no-op persistors
//! - [`commands`]: command table, dispatcher, worker pool and clients
//! - [`connection`]: per-socket read/dispatch/reply loop
//! - [`server`]: boot, accept loop and graceful shutdown
//! - [`config`]: command-line and environment configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod task;

pub use commands::Dispatcher;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use error::{Error, Result};
pub use protocol::{ParseError, RespParser, RespValue};
pub use server::{Server, ServerConfig};
pub use storage::{ExpiryConfig, ExpirySweeper, KeyValueStore};

/// The default port kvstore listens on
pub const DEFAULT_PORT: u16 = 7275;

/// The default host kvstore binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of kvstore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
