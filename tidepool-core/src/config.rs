//! Project config file (`tidepool.json`) parsing and validation.
//!
//! The file is parsed with serde into a permissive raw shape, then validated
//! into a [`ProjectConfig`]. Unknown keys are collected (not rejected) so the
//! caller can warn about them.
//!
//! ```json
//! {
//!   "name": "game",
//!   "placeIds": [1818],
//!   "partitions": { "shared": { "path": "src/shared", "target": "ReplicatedStorage.Shared" } }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{config_io_err, ConfigError};
use crate::types::{AuthorizationPolicy, PlaceId, ProjectName};

pub const CONFIG_FILE_NAME: &str = "tidepool.json";
pub const DEFAULT_PARTITION_NAME: &str = "default";
pub const DEFAULT_PARTITION_PATH: &str = "src";

#[derive(Debug, Deserialize)]
struct RawConfig {
    name: String,
    #[serde(rename = "placeIds")]
    place_ids: Option<Vec<u64>>,
    #[serde(rename = "allowAnyPlaceId")]
    allow_any_place_id: Option<bool>,
    partitions: Option<BTreeMap<String, RawPartition>>,
}

#[derive(Debug, Deserialize)]
struct RawPartition {
    path: String,
    target: String,
}

/// One configured partition, with its path still relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    pub path: PathBuf,
    pub target: String,
}

impl PartitionSpec {
    /// The partition's directory (or file) joined onto the project root.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

/// A validated project config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: ProjectName,
    pub policy: AuthorizationPolicy,
    /// Sorted by partition name.
    pub partitions: Vec<PartitionSpec>,
    /// Keys present in the file that the config format does not know.
    pub ignored_keys: Vec<String>,
}

/// `<root>/tidepool.json`: pure, no I/O.
pub fn config_path_at(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

/// Read and validate `<root>/tidepool.json`.
///
/// Returns `ConfigError::NotFound` if the file is absent.
pub fn load_at(root: &Path) -> Result<ProjectConfig, ConfigError> {
    let path = config_path_at(root);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound { path });
        }
        Err(err) => return Err(config_io_err(&path, err)),
    };
    parse_str(&contents, &path)
}

/// Parse and validate config text. `path` is only used for error context.
pub fn parse_str(contents: &str, path: &Path) -> Result<ProjectConfig, ConfigError> {
    let mut ignored_keys = Vec::new();
    let mut deserializer = serde_json::Deserializer::from_str(contents);
    let raw: RawConfig =
        serde_ignored::deserialize(&mut deserializer, |key: serde_ignored::Path| {
            ignored_keys.push(key.to_string());
        })
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    deserializer.end().map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate(raw, ignored_keys)
}

fn validate(raw: RawConfig, ignored_keys: Vec<String>) -> Result<ProjectConfig, ConfigError> {
    if raw.name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }

    let policy = match (raw.allow_any_place_id, raw.place_ids) {
        (Some(true), Some(ids)) if !ids.is_empty() => {
            return Err(ConfigError::AmbiguousAuthorization)
        }
        (Some(true), _) => AuthorizationPolicy::AllowAny,
        (_, None) => return Err(ConfigError::MissingAuthorization),
        (_, Some(ids)) => {
            if let Some(&bad) = ids.iter().find(|&&id| id == 0) {
                return Err(ConfigError::InvalidPlaceId(bad));
            }
            AuthorizationPolicy::ExplicitIds(ids.into_iter().map(PlaceId).collect::<BTreeSet<_>>())
        }
    };

    let partitions = match raw.partitions {
        None => vec![PartitionSpec {
            name: DEFAULT_PARTITION_NAME.to_string(),
            path: PathBuf::from(DEFAULT_PARTITION_PATH),
            target: String::new(),
        }],
        Some(map) if map.is_empty() => return Err(ConfigError::NoPartitions),
        Some(map) => map
            .into_iter()
            .map(|(name, partition)| PartitionSpec {
                name,
                path: PathBuf::from(partition.path),
                target: partition.target,
            })
            .collect(),
    };

    Ok(ProjectConfig {
        name: ProjectName::from(raw.name),
        policy,
        partitions,
        ignored_keys,
    })
}
