//! Domain types shared by the sync engine and the daemon.
//!
//! Everything that crosses the wire (`Update`, `ProjectPayload`, `SubmitBody`)
//! serializes to the JSON shape the remote companion expects.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// The configured name of a project (the unit of config hot-reload).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectName(pub String);

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ProjectName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of one remote connection, as sent in the `client-id` header.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Numeric id of the remote target a client is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlaceId(pub u64);

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for PlaceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Assets
// ---------------------------------------------------------------------------

/// Classification of an asset, derived from a sub-extension in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum AssetKind {
    #[default]
    Module,
    ServerExecutable,
    ClientExecutable,
}

impl AssetKind {
    /// Map a sub-extension token (`"server"` in `a.server.lua`) to a kind.
    ///
    /// Returns `None` for tokens that carry no kind; such files are modules and
    /// keep the token as part of their name.
    pub fn from_sub_extension(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "server" => Some(Self::ServerExecutable),
            "client" => Some(Self::ClientExecutable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Module => "Module",
            AssetKind::ServerExecutable => "ServerExecutable",
            AssetKind::ClientExecutable => "ClientExecutable",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Module" => Ok(Self::Module),
            "ServerExecutable" => Ok(Self::ServerExecutable),
            "ClientExecutable" => Ok(Self::ClientExecutable),
            other => Err(format!("unknown asset kind '{other}'")),
        }
    }
}

/// Ordered segments locating a node in the remote namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AssetPath(pub Vec<String>);

impl AssetPath {
    /// Parse a dot-separated target prefix; empty segments are dropped.
    pub fn from_target(target: &str) -> Self {
        Self(
            target
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn push(&mut self, segment: impl Into<String>) {
        self.0.push(segment.into());
    }

    pub fn join(&self) -> String {
        self.0.join("/")
    }
}

impl<S: Into<String>> FromIterator<S> for AssetPath {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// A pending change to one asset. `source: None` denotes removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub path: AssetPath,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub source: Option<String>,
}

impl Update {
    pub fn change(path: AssetPath, kind: AssetKind, source: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            source: Some(source.into()),
        }
    }

    pub fn remove(path: AssetPath, kind: AssetKind) -> Self {
        Self {
            path,
            kind,
            source: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.source.is_none()
    }

    /// `joined path + "/" + kind`; at most one pending update per key.
    pub fn coalescing_key(&self) -> String {
        format!("{}/{}", self.path.join(), self.kind)
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

fn is_false(value: &bool) -> bool {
    !*value
}

/// One entry of a long-poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPayload {
    pub project_name: ProjectName,
    pub changes: Vec<Update>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub initial: bool,
}

/// Body of a submission request carrying remote-originated edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    pub project_name: ProjectName,
    #[serde(default)]
    pub changes: Vec<Update>,
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Which place ids may exchange updates with a project. Exactly one variant is
/// active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationPolicy {
    AllowAny,
    ExplicitIds(BTreeSet<PlaceId>),
}

impl AuthorizationPolicy {
    pub fn is_authorized(&self, place: PlaceId) -> bool {
        match self {
            AuthorizationPolicy::AllowAny => true,
            AuthorizationPolicy::ExplicitIds(ids) => ids.contains(&place),
        }
    }

    /// True when both policies are the same variant (ids may differ).
    pub fn same_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (AuthorizationPolicy::AllowAny, AuthorizationPolicy::AllowAny)
                | (
                    AuthorizationPolicy::ExplicitIds(_),
                    AuthorizationPolicy::ExplicitIds(_)
                )
        )
    }
}

impl fmt::Display for AuthorizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorizationPolicy::AllowAny => f.write_str("any"),
            AuthorizationPolicy::ExplicitIds(ids) => {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", ids.join(", "))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
