//! Chained Hash Table
//!
//! This module implements the hash table that backs the key-value store.
//! Collisions are resolved by chaining: every bucket holds the head of a
//! singly-linked list of entries that hash to it.
//!
//! ## Layout
//!
//! Instead of heap-allocated nodes with `next` pointers, entries live in a
//! flat arena (`slots`) and link to each other by index:
//!
//! ```text
//!  buckets            slots (arena)
//! ┌───────┐         ┌──────────────────────────┐
//! │ 0: ●──┼────────>│ 3: "hello" -> next: 1    │──┐
//! │ 1: -  │         ├──────────────────────────┤  │
//! │ 2: ●──┼──┐      │ 1: "hallo" -> next: none │<─┘
//! │ 3: -  │  │      ├──────────────────────────┤
//! └───────┘  └─────>│ 0: "world" -> next: none │
//!                   └──────────────────────────┘
//! ```
//!
//! Vacant slots are recycled through a free list.
//!
//! ## Resizing
//!
//! The load factor (`len / buckets`) is kept within
//! `[min_load_factor, max_load_factor]`. An insert that pushes it above the
//! maximum doubles the bucket count; a removal that drops it below the
//! minimum halves it (never below the initial bucket count). A resize
//! rehashes every entry into a freshly built bucket array and arena and then
//! swaps both in, so the table is never observed half-migrated.

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

/// Default number of buckets for a new table.
pub const DEFAULT_BUCKETS: usize = 16;

/// Below this load factor the table shrinks.
pub const MIN_LOAD_FACTOR: f64 = 0.25;

/// Above this load factor the table grows.
pub const MAX_LOAD_FACTOR: f64 = 0.75;

/// Sizing policy for a [`HashTable`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableConfig {
    /// Number of buckets the table starts with (and never shrinks below)
    pub initial_buckets: usize,
    /// Shrink threshold
    pub min_load_factor: f64,
    /// Grow threshold
    pub max_load_factor: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_buckets: DEFAULT_BUCKETS,
            min_load_factor: MIN_LOAD_FACTOR,
            max_load_factor: MAX_LOAD_FACTOR,
        }
    }
}

/// A single entry in a bucket chain.
#[derive(Debug)]
struct Slot<V> {
    key: Bytes,
    value: V,
    next: Option<usize>,
}

/// A hash table with separate chaining and load-factor driven resizing.
///
/// The table itself is not synchronized; callers that share it across
/// threads wrap it in a lock (see [`crate::storage::KeyValueStore`]). Every
/// mutating method takes `&mut self`, so a resize always happens under
/// exclusive access.
///
/// # Example
///
/// ```
/// use kvstore::storage::HashTable;
/// use bytes::Bytes;
///
/// let mut table = HashTable::new();
/// table.insert(Bytes::from("name"), "kvstore");
/// assert_eq!(table.get(b"name"), Some(&"kvstore"));
/// assert_eq!(table.len(), 1);
/// ```
#[derive(Debug)]
pub struct HashTable<V> {
    /// Head slot index of each bucket chain
    buckets: Vec<Option<usize>>,
    /// Entry arena; `None` marks a vacant slot
    slots: Vec<Option<Slot<V>>>,
    /// Vacant slot indices available for reuse
    free: Vec<usize>,
    /// Number of reachable entries
    count: usize,
    config: TableConfig,
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HashTable<V> {
    /// Creates an empty table with the default sizing policy.
    pub fn new() -> Self {
        Self::with_config(TableConfig::default())
    }

    /// Creates an empty table with a custom sizing policy.
    pub fn with_config(config: TableConfig) -> Self {
        let config = TableConfig {
            initial_buckets: config.initial_buckets.max(1),
            ..config
        };

        Self {
            buckets: vec![None; config.initial_buckets],
            slots: Vec::new(),
            free: Vec::new(),
            count: 0,
            config,
        }
    }

    /// Number of entries in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns true if the table holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current number of buckets.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Current load factor (`len / bucket_count`).
    #[inline]
    pub fn load_factor(&self) -> f64 {
        self.count as f64 / self.buckets.len() as f64
    }

    #[inline]
    fn bucket_of(&self, key: &[u8]) -> usize {
        bucket_index(key, self.buckets.len())
    }

    fn slot(&self, index: usize) -> &Slot<V> {
        match &self.slots[index] {
            Some(slot) => slot,
            None => unreachable!("bucket chain points at vacant slot {index}"),
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot<V> {
        match &mut self.slots[index] {
            Some(slot) => slot,
            None => unreachable!("bucket chain points at vacant slot {index}"),
        }
    }

    /// Finds the slot index holding `key`.
    fn find(&self, key: &[u8]) -> Option<usize> {
        let mut cursor = self.buckets[self.bucket_of(key)];
        while let Some(index) = cursor {
            let slot = self.slot(index);
            if slot.key.as_ref() == key {
                return Some(index);
            }
            cursor = slot.next;
        }
        None
    }

    /// Inserts or overwrites a key.
    ///
    /// A new key is prepended to its bucket chain; an existing key has its
    /// value replaced in place and the previous value is returned.
    pub fn insert(&mut self, key: Bytes, value: V) -> Option<V> {
        if let Some(index) = self.find(&key) {
            let slot = self.slot_mut(index);
            return Some(std::mem::replace(&mut slot.value, value));
        }

        let bucket = self.bucket_of(&key);
        let slot = Slot {
            key,
            value,
            next: self.buckets[bucket],
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };

        self.buckets[bucket] = Some(index);
        self.count += 1;
        self.verify_load_factor();

        None
    }

    /// Returns a reference to the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.find(key).map(|index| &self.slot(index).value)
    }

    /// Returns a mutable reference to the value stored under `key`.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        let index = self.find(key)?;
        Some(&mut self.slot_mut(index).value)
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Unlinks `key` from its chain and returns its value.
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let bucket = self.bucket_of(key);
        let mut prev: Option<usize> = None;
        let mut cursor = self.buckets[bucket];

        while let Some(index) = cursor {
            let (matches, next) = {
                let slot = self.slot(index);
                (slot.key.as_ref() == key, slot.next)
            };

            if matches {
                let value = self.unlink(bucket, prev, index);
                self.verify_load_factor();
                return Some(value);
            }

            prev = Some(index);
            cursor = next;
        }

        None
    }

    /// Detaches the slot at `index` (whose predecessor is `prev`) and frees it.
    fn unlink(&mut self, bucket: usize, prev: Option<usize>, index: usize) -> V {
        let slot = match self.slots[index].take() {
            Some(slot) => slot,
            None => unreachable!("unlinking vacant slot {index}"),
        };

        match prev {
            Some(prev) => self.slot_mut(prev).next = slot.next,
            None => self.buckets[bucket] = slot.next,
        }

        self.free.push(index);
        self.count -= 1;
        slot.value
    }

    /// Keeps only the entries for which `keep` returns true.
    ///
    /// Returns the removed entries. The load factor is checked once after
    /// the whole pass.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(Bytes, V)>
    where
        F: FnMut(&Bytes, &mut V) -> bool,
    {
        let mut removed = Vec::new();

        for bucket in 0..self.buckets.len() {
            let mut prev: Option<usize> = None;
            let mut cursor = self.buckets[bucket];

            while let Some(index) = cursor {
                let (retained, next) = {
                    let slot = self.slot_mut(index);
                    (keep(&slot.key, &mut slot.value), slot.next)
                };

                if retained {
                    prev = Some(index);
                } else {
                    let key = self.slot(index).key.clone();
                    let value = self.unlink(bucket, prev, index);
                    removed.push((key, value));
                }
                cursor = next;
            }
        }

        if !removed.is_empty() {
            self.verify_load_factor();
        }

        removed
    }

    /// Removes every entry and resets the table to its initial size.
    ///
    /// Returns the number of entries removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.count;
        self.buckets = vec![None; self.config.initial_buckets];
        self.slots = Vec::new();
        self.free = Vec::new();
        self.count = 0;
        removed
    }

    /// Iterates over all entries in bucket-then-chain order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            bucket: 0,
            cursor: None,
        }
    }

    /// Grows or shrinks the bucket array when the load factor leaves its band.
    fn verify_load_factor(&mut self) {
        if self.count == 0 {
            return;
        }

        let load_factor = self.load_factor();
        if load_factor > self.config.max_load_factor {
            self.resize(self.buckets.len() * 2);
        } else if load_factor < self.config.min_load_factor
            && self.buckets.len() > self.config.initial_buckets
        {
            self.resize((self.buckets.len() / 2).max(self.config.initial_buckets));
        }
    }

    /// Rehashes every entry into a new bucket array of `new_len` buckets.
    ///
    /// The arena is compacted in the same pass, so the free list is empty
    /// afterwards.
    fn resize(&mut self, new_len: usize) {
        let mut buckets: Vec<Option<usize>> = vec![None; new_len];
        let mut slots: Vec<Option<Slot<V>>> = Vec::with_capacity(self.count);

        for bucket in 0..self.buckets.len() {
            let mut cursor = self.buckets[bucket];
            while let Some(index) = cursor {
                let mut slot = match self.slots[index].take() {
                    Some(slot) => slot,
                    None => unreachable!("bucket chain points at vacant slot {index}"),
                };
                cursor = slot.next;

                let target = bucket_index(&slot.key, new_len);
                slot.next = buckets[target];
                buckets[target] = Some(slots.len());
                slots.push(Some(slot));
            }
        }

        debug_assert_eq!(slots.len(), self.count, "resize lost or duplicated entries");

        self.buckets = buckets;
        self.slots = slots;
        self.free.clear();
    }
}

#[inline]
fn bucket_index(key: &[u8], buckets: usize) -> usize {
    (xxh3_64(key) % buckets as u64) as usize
}

/// Iterator over the entries of a [`HashTable`].
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    bucket: usize,
    cursor: Option<usize>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a Bytes, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(index) = self.cursor {
                let slot = self.table.slot(index);
                self.cursor = slot.next;
                return Some((&slot.key, &slot.value));
            }

            if self.bucket >= self.table.buckets.len() {
                return None;
            }

            self.cursor = self.table.buckets[self.bucket];
            self.bucket += 1;
        }
    }
}

impl<'a, V> IntoIterator for &'a HashTable<V> {
    type Item = (&'a Bytes, &'a V);
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
