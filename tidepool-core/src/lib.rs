//! tidepool core library: domain types, config validation, language registry.
//!
//! Public API surface:
//! - [`types`]: newtypes, assets, wire payloads, authorization policy
//! - [`config`]: `tidepool.json` load / validate
//! - [`language`]: [`LanguageRegistry`] and source loaders
//! - [`error`]: [`ConfigError`], [`LanguageError`]

pub mod config;
pub mod error;
pub mod language;
pub mod types;

pub use config::{PartitionSpec, ProjectConfig, CONFIG_FILE_NAME};
pub use error::{ConfigError, LanguageError};
pub use language::{LanguageRegistry, SourceLoader};
pub use types::{
    AssetKind, AssetPath, AuthorizationPolicy, ClientId, PlaceId, ProjectName, ProjectPayload,
    SubmitBody, Update,
};
