//! TTL-Aware Key-Value Store
//!
//! This module implements the keyspace of the server: a [`HashTable`] of
//! [`Item`]s behind a single reader-writer lock, with per-item expiry.
//!
//! ## Expiry
//!
//! Expired items are removed in two ways:
//!
//! 1. **Lazy expiry**: a read that finds an expired item treats it as absent
//!    and removes it.
//! 2. **Active expiry**: the background sweeper (see [`super::expiry`])
//!    calls [`KeyValueStore::cleanup_expired`] periodically, which bounds the
//!    memory held by dead keys that are never read again.
//!
//! Every read path (`get`, `exists`, `keys`, `values`) hides items whose
//! deadline has passed even if neither mechanism has removed them yet.
//!
//! Once an expiry is set on an item it can be moved by another `expire`, but
//! only a fresh `store` makes the item non-expiring again.
//!
//! ## Locking
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              KeyValueStore               │
//! │   RwLock ──> HashTable<Item>             │
//! │              ├─ buckets (resized here)   │
//! │              └─ slots                    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Readers share the lock; inserts, deletes and therefore resizes take it
//! exclusively. A resize swaps the bucket array while no reader can hold a
//! reference to it, and pattern deletes run as one exclusive pass, so `len()`
//! never disagrees with the set of reachable items.

use crate::storage::glob::{is_glob, GlobPattern, PatternError};
use crate::storage::hashtable::{HashTable, TableConfig};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A stored value together with its expiry metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The key this item is stored under
    pub key: Bytes,
    /// The stored value
    pub data: Bytes,
    /// When this item expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// When this item was stored
    pub created_at: Instant,
}

impl Item {
    /// Creates an item that never expires.
    pub fn new(key: Bytes, data: Bytes) -> Self {
        Self {
            key,
            data,
            expires_at: None,
            created_at: Instant::now(),
        }
    }

    /// Creates an item that expires after `ttl`.
    ///
    /// A zero TTL means the item never expires, and so does a TTL too
    /// large for the clock to represent.
    pub fn with_ttl(key: Bytes, data: Bytes, ttl: Duration) -> Self {
        let mut item = Self::new(key, data);
        if !ttl.is_zero() {
            item.expires_at = item.created_at.checked_add(ttl);
        }
        item
    }

    /// Payload size in bytes (key plus value).
    #[inline]
    pub fn size(&self) -> usize {
        self.key.len() + self.data.len()
    }

    /// Returns true if this item carries an expiry deadline.
    #[inline]
    pub fn expires(&self) -> bool {
        self.expires_at.is_some()
    }

    #[inline]
    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Checks if this item has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry, or None if the item never expires.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Precondition for [`KeyValueStore::store_if`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// Only if no live item exists (`NX`)
    IfAbsent,
    /// Only if a live item exists (`XX`)
    IfPresent,
}

/// Operation counters exposed through `INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of entries in the table (including expired, unswept ones)
    pub keys: u64,
    /// Entries that carry an expiry deadline
    pub expiring_keys: u64,
    /// Total GET-style lookups
    pub get_ops: u64,
    /// Total stores
    pub set_ops: u64,
    /// Total keys removed by deletes
    pub del_ops: u64,
    /// Total keys removed by expiry (lazy or active)
    pub expired: u64,
    /// Current bucket count of the hash table
    pub buckets: u64,
}

/// The thread-safe, TTL-aware key-value store.
///
/// Designed to be wrapped in an `Arc` and shared by every worker thread.
#[derive(Debug)]
pub struct KeyValueStore {
    table: RwLock<HashTable<Item>>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore {
    /// Creates an empty store with the default table sizing.
    pub fn new() -> Self {
        Self::with_config(TableConfig::default())
    }

    /// Creates an empty store with a custom table sizing policy.
    pub fn with_config(config: TableConfig) -> Self {
        Self {
            table: RwLock::new(HashTable::with_config(config)),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    /// Inserts or overwrites an item, stamping its creation time.
    ///
    /// Returns true if the key was not present (or had expired).
    pub fn store(&self, mut item: Item) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);
        item.created_at = Instant::now();

        let key = item.key.clone();
        let previous = self.table.write().insert(key, item);

        match previous {
            None => true,
            Some(old) => old.is_expired(),
        }
    }

    /// Stores an item only if the key's liveness satisfies `condition`.
    ///
    /// The check and the store happen under one write lock. Returns true if
    /// the item was stored.
    pub fn store_if(&self, mut item: Item, condition: SetCondition) -> bool {
        let mut table = self.table.write();
        let live = table.get(&item.key).is_some_and(|old| !old.is_expired());

        let allowed = match condition {
            SetCondition::Always => true,
            SetCondition::IfAbsent => !live,
            SetCondition::IfPresent => live,
        };
        if !allowed {
            return false;
        }

        self.set_count.fetch_add(1, Ordering::Relaxed);
        item.created_at = Instant::now();
        let key = item.key.clone();
        table.insert(key, item);
        true
    }

    /// Stores a value without expiry.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.store(Item::new(key, value))
    }

    /// Stores a value that expires after `ttl`.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        self.store(Item::with_ttl(key, value, ttl))
    }

    /// Looks up a live item.
    ///
    /// An expired item is reported as absent and removed.
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        self.get_count.fetch_add(1, Ordering::Relaxed);

        {
            let table = self.table.read();
            match table.get(key) {
                None => return None,
                Some(item) if !item.is_expired() => return Some(item.clone()),
                Some(_) => {}
            }
        }

        // Expired: upgrade to a write lock and re-check, another writer
        // may have replaced the item in between.
        let mut table = self.table.write();
        match table.get(key) {
            Some(item) if item.is_expired() => {
                table.remove(key);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(item) => Some(item.clone()),
            None => None,
        }
    }

    /// Sets (or moves) the expiry deadline of a live item to `now + ttl`.
    ///
    /// A zero TTL removes the item at once. A TTL too large for the clock
    /// leaves the item without a deadline. Returns 1 if the key exists,
    /// 0 otherwise.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> u64 {
        let mut table = self.table.write();
        let now = Instant::now();

        let live = match table.get_mut(key) {
            None => return 0,
            Some(item) if item.is_expired_at(now) => false,
            Some(item) if !ttl.is_zero() => {
                item.expires_at = now.checked_add(ttl);
                return 1;
            }
            Some(_) => true,
        };

        table.remove(key);
        self.expired_count.fetch_add(1, Ordering::Relaxed);
        u64::from(live)
    }

    /// Deletes a key.
    ///
    /// If the exact key is absent and it contains a glob metacharacter, it
    /// is treated as a pattern instead. An invalid pattern deletes nothing.
    /// Returns the number of live keys removed.
    pub fn delete(&self, key: &[u8]) -> u64 {
        let removed = self.table.write().remove(key);

        match removed {
            Some(item) if item.is_expired() => {
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                0
            }
            Some(_) => {
                self.del_count.fetch_add(1, Ordering::Relaxed);
                1
            }
            None if is_glob(key) => self.delete_by_pattern(key).unwrap_or(0),
            None => 0,
        }
    }

    /// Deletes every key matching a glob pattern in one exclusive pass.
    ///
    /// Expired matches are purged too but are not counted.
    pub fn delete_by_pattern(&self, pattern: &[u8]) -> Result<u64, PatternError> {
        let pattern = GlobPattern::new(pattern)?;
        if pattern.matches_everything() {
            return Ok(self.clear());
        }

        let now = Instant::now();
        let removed = self
            .table
            .write()
            .retain(|key, _| !pattern.matches(key));

        Ok(self.account_removed(removed.iter().map(|(_, item)| item), now))
    }

    /// Returns all live keys.
    pub fn keys(&self) -> Vec<Bytes> {
        let now = Instant::now();
        self.table
            .read()
            .iter()
            .filter(|(_, item)| !item.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Returns all live keys matching a glob pattern.
    ///
    /// **Warning**: This scans the whole table.
    pub fn keys_with_pattern(&self, pattern: &[u8]) -> Result<Vec<Bytes>, PatternError> {
        let pattern = GlobPattern::new(pattern)?;
        let now = Instant::now();

        Ok(self
            .table
            .read()
            .iter()
            .filter(|(key, item)| !item.is_expired_at(now) && pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Returns a copy of every live item.
    pub fn values(&self) -> Vec<Item> {
        let now = Instant::now();
        self.table
            .read()
            .iter()
            .filter(|(_, item)| !item.is_expired_at(now))
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Removes every item. Returns the number of live items removed.
    pub fn clear(&self) -> u64 {
        let now = Instant::now();
        let mut table = self.table.write();

        let live = table
            .iter()
            .filter(|(_, item)| !item.is_expired_at(now))
            .count() as u64;
        let total = table.clear() as u64;

        self.del_count.fetch_add(live, Ordering::Relaxed);
        self.expired_count.fetch_add(total - live, Ordering::Relaxed);
        live
    }

    /// Returns true if a live item is stored under `key`.
    pub fn exists(&self, key: &[u8]) -> bool {
        self.table
            .read()
            .get(key)
            .is_some_and(|item| !item.is_expired())
    }

    /// Number of entries in the table.
    ///
    /// Expired items that have not been swept yet are included.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired item.
    ///
    /// Called by the background expiry sweeper. Returns the number of items
    /// removed.
    pub fn cleanup_expired(&self) -> u64 {
        let now = Instant::now();
        let removed = self.table.write().retain(|_, item| !item.is_expired_at(now));

        let cleaned = removed.len() as u64;
        if cleaned > 0 {
            self.expired_count.fetch_add(cleaned, Ordering::Relaxed);
        }
        cleaned
    }

    /// Returns a point-in-time view of the store's counters.
    pub fn stats(&self) -> StorageStats {
        let (keys, expiring_keys, buckets) = {
            let table = self.table.read();
            let expiring = table.iter().filter(|(_, item)| item.expires()).count();
            (table.len() as u64, expiring as u64, table.bucket_count() as u64)
        };

        StorageStats {
            keys,
            expiring_keys,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
            buckets,
        }
    }

    /// Updates the delete/expiry counters for a batch of removed items and
    /// returns how many of them were still live.
    fn account_removed<'a>(&self, removed: impl Iterator<Item = &'a Item>, now: Instant) -> u64 {
        let (mut live, mut expired) = (0u64, 0u64);
        for item in removed {
            if item.is_expired_at(now) {
                expired += 1;
            } else {
                live += 1;
            }
        }

        self.del_count.fetch_add(live, Ordering::Relaxed);
        self.expired_count.fetch_add(expired, Ordering::Relaxed);
        live
    }
}
