//! Error types for tidepool-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or validating a project config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    /// Underlying I/O failure while reading the config.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parse error: includes the file path and serde_json's line context.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: name must be a non-empty string")]
    EmptyName,

    #[error("invalid configuration: set either allowAnyPlaceId: true or placeIds")]
    MissingAuthorization,

    #[error("invalid configuration: allowAnyPlaceId and placeIds are mutually exclusive")]
    AmbiguousAuthorization,

    #[error("invalid configuration: placeIds must be positive integers (got {0})")]
    InvalidPlaceId(u64),

    #[error("invalid configuration: need at least one partition")]
    NoPartitions,
}

/// Errors raised by the language registry.
#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("duplicate language definition: {name} ({extension})")]
    DuplicateDefinition { name: String, extension: String },

    #[error("no applicable loader for {path}")]
    NoApplicableLoader { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external transform step failed.
    #[error("loader {language} failed for {path}: {message}")]
    Transform {
        language: String,
        path: PathBuf,
        message: String,
    },
}

pub(crate) fn config_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn language_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LanguageError {
    LanguageError::Io {
        path: path.into(),
        source,
    }
}
