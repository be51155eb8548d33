//! Append-only command log.
//!
//! ```text
//!  workers ──record()──> [ pending buffer ]        (buffer lock only)
//!                               │
//!  flush ticker ──flush()───────┘──> file.write_all + sync_data
//!                                    (file lock, then buffer lock)
//! ```
//!
//! Requests only append to the in-memory buffer. A flush takes the pending
//! bytes out of the buffer, releases the buffer lock and then writes and
//! syncs them, so recording never waits on an fsync. If the write fails the
//! bytes go back to the front of the buffer for the next tick.

use crate::error::{Error, Result};
use crate::persistence::line::{format_command, split_args};
use crate::persistence::{Persistor, Recovery};
use crate::storage::KeyValueStore;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default log file name.
pub const DEFAULT_AOF_FILE: &str = "kvstore-aof.log";

/// Default interval between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Unflushed bytes past which a failing flush is logged as an error.
const PENDING_ALERT_BYTES: usize = 64 * 1024 * 1024;

/// Append-only file persistor.
#[derive(Debug)]
pub struct AofPersistor {
    path: PathBuf,
    flush_interval: Duration,
    /// Lines recorded since the last successful flush
    pending: Mutex<Vec<u8>>,
    /// Held for the whole of a flush or truncate
    file: Mutex<File>,
}

impl AofPersistor {
    /// Opens (creating if needed) the log at `path` for appending.
    pub fn open(path: impl AsRef<Path>, flush_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;

        info!(path = %path.display(), "Opened append-only log");

        Ok(Self {
            path,
            flush_interval,
            pending: Mutex::new(Vec::with_capacity(4096)),
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of recorded bytes not yet flushed.
    pub fn pending_bytes(&self) -> usize {
        self.pending.lock().len()
    }

    fn write_pending(&self, file: &mut File, data: &[u8]) -> std::io::Result<()> {
        let start = file.seek(SeekFrom::End(0))?;

        let result = file.write_all(data).and_then(|_| file.sync_data());
        if result.is_err() {
            // Drop a partially written tail so the retry does not leave half a line
            if let Err(e) = file.set_len(start) {
                warn!(path = %self.path.display(), error = %e, "Failed to roll back partial log write");
            }
        }
        result
    }
}

impl Persistor for AofPersistor {
    fn name(&self) -> &'static str {
        "aof"
    }

    fn record(&self, argv: &[Bytes]) {
        let mut line = format_command(argv);
        line.push(b'\n');

        self.pending.lock().extend_from_slice(&line);
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();

        let data = std::mem::take(&mut *self.pending.lock());
        if data.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.write_pending(&mut file, &data) {
            let mut pending = self.pending.lock();
            let newer = std::mem::replace(&mut *pending, data);
            pending.extend_from_slice(&newer);

            let buffered = pending.len();
            if buffered >= PENDING_ALERT_BYTES {
                error!(
                    path = %self.path.display(),
                    pending_bytes = buffered,
                    "Append-only log is not being written and unflushed writes keep growing"
                );
            } else {
                warn!(
                    path = %self.path.display(),
                    pending_bytes = buffered,
                    "Append-only log flush failed, keeping writes for retry"
                );
            }
            return Err(Error::io(&self.path, e));
        }

        debug!(bytes = data.len(), "Flushed append-only log");
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        let file = self.file.lock();
        self.pending.lock().clear();

        file.set_len(0).map_err(|e| Error::io(&self.path, e))?;
        file.sync_all().map_err(|e| Error::io(&self.path, e))?;

        debug!(path = %self.path.display(), "Truncated append-only log");
        Ok(())
    }

    fn load(&self) -> Result<Recovery> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let path = self.path.clone();

        let commands = BufReader::new(file)
            .split(b'\n')
            .enumerate()
            .filter_map(move |(index, line)| {
                let line_no = index + 1;
                match line {
                    Err(e) => Some(Err(Error::io(&path, e))),
                    Ok(line) => match split_args(&line) {
                        Ok(argv) if argv.is_empty() => None,
                        Ok(argv) => Some(Ok(argv)),
                        Err(e) => Some(Err(Error::CorruptLog {
                            line: line_no,
                            reason: e.to_string(),
                        })),
                    },
                }
            });

        Ok(Recovery::Commands(Box::new(commands)))
    }

    fn save(&self, _store: &KeyValueStore) -> Result<()> {
        // The log already holds every write
        self.flush()
    }

    fn close(&self) -> Result<()> {
        self.flush()?;
        self.file
            .lock()
            .sync_all()
            .map_err(|e| Error::io(&self.path, e))?;

        info!(path = %self.path.display(), "Closed append-only log");
        Ok(())
    }

    fn flush_interval(&self) -> Option<Duration> {
        Some(self.flush_interval)
    }
}
