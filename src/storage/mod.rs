//! Storage Module
//!
//! This module provides the keyspace of the server: a hand-built chained
//! hash table, the TTL-aware store layered on top of it, glob matching for
//! pattern commands, and the background expiry sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                KeyValueStore                │
//! │   RwLock<HashTable<Item>>   glob matcher    │
//! └─────────────────────────────────────────────┘
//!                       ▲
//!                       │ cleanup_expired()
//!         ┌─────────────┴─────────────┐
//!         │      ExpirySweeper        │
//!         │  (PeriodicTask, 1s tick)  │
//!         └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use kvstore::storage::KeyValueStore;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let store = KeyValueStore::new();
//!
//! store.set(Bytes::from("name"), Bytes::from("kvstore"));
//! let item = store.get(b"name").unwrap();
//! assert_eq!(item.data, Bytes::from("kvstore"));
//!
//! store.set_with_ttl(
//!     Bytes::from("session"),
//!     Bytes::from("token123"),
//!     Duration::from_secs(3600),
//! );
//! assert_eq!(store.delete(b"s*"), 1);
//! ```

pub mod engine;
pub mod expiry;
pub mod glob;
pub mod hashtable;

pub use engine::{Item, KeyValueStore, SetCondition, StorageStats};
pub use expiry::{ExpiryConfig, ExpirySweeper};
pub use glob::{GlobPattern, PatternError};
pub use hashtable::{HashTable, TableConfig};
