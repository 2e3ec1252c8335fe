//! Error types for tidepool-sync.

use std::path::PathBuf;

use thiserror::Error;

use tidepool_core::{ConfigError, PlaceId, ProjectName};

/// All errors that can arise from the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The filesystem watch could not be installed.
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("could not find project directory: {path}")]
    MissingRoot { path: PathBuf },

    #[error("server is not running")]
    NotRunning,

    #[error("place id must not be {0}")]
    InvalidPlaceId(PlaceId),

    #[error("unknown project '{0}'")]
    UnknownProject(ProjectName),

    #[error("place {place} is not authorized for project '{project}'")]
    Unauthorized { project: ProjectName, place: PlaceId },

    #[error("hub is not accepting requests")]
    HubClosed,
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
