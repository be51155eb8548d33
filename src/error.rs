use std::path::{Path, PathBuf};

/// Errors raised by persistence, configuration and server start-up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on file {}: {source}", path.display())]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("Unable to encode snapshot item: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("Corrupt snapshot file {}: {reason}", path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("Corrupt append-only log at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },

    #[error("Unable to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Unable to start worker threads: {0}")]
    Workers(#[source] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Error::Io {
            source,
            path: path.to_path_buf(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
