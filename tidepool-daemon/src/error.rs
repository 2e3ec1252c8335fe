use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime and HTTP server.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sync error: {0}")]
    Sync(#[from] tidepool_sync::SyncError),

    #[error("address {addr} is already in use; is tidepool already running?")]
    AddrInUse { addr: String },

    #[error("daemon protocol error: {0}")]
    Protocol(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
