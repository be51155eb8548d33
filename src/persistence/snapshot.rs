//! Full-store snapshots.
//!
//! File layout:
//!
//! ```text
//! "KVSD" | version (u8) | { len (u32 LE) | bincode(SnapshotItem) }*
//! ```
//!
//! Items are self-delimiting through their length prefix, so the file is
//! read until EOF. A save writes to `<path>.tmp` and renames it over the
//! snapshot, so a crash mid-save leaves the previous snapshot intact.
//!
//! Expiry deadlines are monotonic [`Instant`]s in memory; on disk they are
//! stored as Unix milliseconds and converted back on load. Items whose
//! deadline passed while the server was down are skipped.

use crate::error::{Error, Result};
use crate::persistence::{Persistor, Recovery};
use crate::storage::{Item, KeyValueStore};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Default snapshot file name.
pub const DEFAULT_SNAPSHOT_FILE: &str = "dump.kvsdb";

const SNAPSHOT_MAGIC: &[u8; 4] = b"KVSD";
const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotItem {
    key: Vec<u8>,
    data: Vec<u8>,
    /// Unix milliseconds
    expires_at: Option<u64>,
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl SnapshotItem {
    fn from_item(item: &Item, now: Instant, wall_now: SystemTime) -> Self {
        let expires_at = item
            .expires_at
            .map(|deadline| unix_millis(wall_now + deadline.saturating_duration_since(now)));

        Self {
            key: item.key.to_vec(),
            data: item.data.to_vec(),
            expires_at,
        }
    }

    /// Converts back to an item, or None if it has already expired.
    fn into_item(self, now: Instant, wall_now_ms: u64) -> Option<Item> {
        let mut item = Item::new(Bytes::from(self.key), Bytes::from(self.data));

        if let Some(deadline_ms) = self.expires_at {
            if deadline_ms <= wall_now_ms {
                return None;
            }
            item.expires_at = Some(now + Duration::from_millis(deadline_ms - wall_now_ms));
        }

        Some(item)
    }
}

/// Snapshot persistor.
#[derive(Debug)]
pub struct SnapshotPersistor {
    path: PathBuf,
}

impl SnapshotPersistor {
    /// Opens (creating if needed) the snapshot file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;

        Ok(Self { path })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Writes every live item to the snapshot. Returns the number written.
    pub fn write(&self, store: &KeyValueStore) -> Result<usize> {
        let temp_path = self.temp_path();
        let file = File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        let io = |e| Error::io(&temp_path, e);

        writer.write_all(SNAPSHOT_MAGIC).map_err(io)?;
        writer.write_all(&[SNAPSHOT_VERSION]).map_err(io)?;

        let now = Instant::now();
        let wall_now = SystemTime::now();
        let items = store.values();

        for item in &items {
            let encoded = bincode::serialize(&SnapshotItem::from_item(item, now, wall_now))?;
            writer
                .write_all(&(encoded.len() as u32).to_le_bytes())
                .map_err(io)?;
            writer.write_all(&encoded).map_err(io)?;
        }

        let file = writer.into_inner().map_err(|e| io(e.into_error()))?;
        file.sync_all().map_err(io)?;
        drop(file);

        std::fs::rename(&temp_path, &self.path).map_err(|e| Error::io(&self.path, e))?;

        info!(items = items.len(), path = %self.path.display(), "Snapshot written");
        Ok(items.len())
    }

    /// Reads every unexpired item from the snapshot.
    pub fn read(&self) -> Result<Vec<Item>> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let mut reader = BufReader::with_capacity(64 * 1024, file);
        let corrupt = |reason: &str| Error::CorruptSnapshot {
            path: self.path.clone(),
            reason: reason.to_string(),
        };

        let mut header = [0u8; 5];
        match read_exact_or_eof(&mut reader, &mut header).map_err(|e| Error::io(&self.path, e))? {
            false => return Ok(Vec::new()),
            true if &header[..4] != SNAPSHOT_MAGIC => return Err(corrupt("bad magic")),
            true if header[4] != SNAPSHOT_VERSION => {
                return Err(corrupt(&format!("unsupported version {}", header[4])))
            }
            true => {}
        }

        let now = Instant::now();
        let wall_now_ms = unix_millis(SystemTime::now());
        let mut items = Vec::new();
        let mut skipped = 0usize;

        loop {
            let mut len = [0u8; 4];
            if !read_exact_or_eof(&mut reader, &mut len).map_err(|e| Error::io(&self.path, e))? {
                break;
            }

            let mut encoded = vec![0u8; u32::from_le_bytes(len) as usize];
            reader.read_exact(&mut encoded).map_err(|e| match e.kind() {
                ErrorKind::UnexpectedEof => corrupt("truncated item"),
                _ => Error::io(&self.path, e),
            })?;

            let item: SnapshotItem = bincode::deserialize(&encoded)?;
            match item.into_item(now, wall_now_ms) {
                Some(item) => items.push(item),
                None => skipped += 1,
            }
        }

        debug!(loaded = items.len(), skipped_expired = skipped, "Snapshot read");
        Ok(items)
    }

    /// Empties the snapshot file.
    pub fn clear(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        file.set_len(0).map_err(|e| Error::io(&self.path, e))
    }
}

/// Fills `buf` completely. Returns false on a clean EOF before the first byte.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl Persistor for SnapshotPersistor {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn record(&self, _argv: &[Bytes]) {}

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        self.clear()
    }

    fn load(&self) -> Result<Recovery> {
        Ok(Recovery::Items(self.read()?))
    }

    fn save(&self, store: &KeyValueStore) -> Result<()> {
        self.write(store).map(|_| ())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
