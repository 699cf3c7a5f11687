//! Local change model

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::{Error, Result};

static RESOURCE_TYPE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("Invalid regex"));

/// A resource type name such as `Patient` or `Observation`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceType(String);

impl ResourceType {
    /// Validate and wrap a resource type name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if RESOURCE_TYPE_PATTERN.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(Error::InvalidInput(format!(
                "'{name}' is not a valid resource type"
            )))
        }
    }

    /// Get the type name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourceType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.0
    }
}

/// Identity of a resource: its type plus logical id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

/// Kind of a recorded mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// Resource created locally; payload is the full resource
    Insert,
    /// Resource modified; payload is a JSON patch array
    Update,
    /// Resource removed; payload is empty
    Delete,
    /// Change with no effect on the server
    NoOp,
}

impl ChangeType {
    /// Stable storage code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::NoOp => "NO_OP",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "NO_OP" => Ok(Self::NoOp),
            other => Err(Error::InvalidInput(format!("unknown change type '{other}'"))),
        }
    }
}

/// Monotonically increasing identifier of a recorded change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalChangeToken(pub i64);

impl fmt::Display for LocalChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One locally recorded mutation awaiting upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub change_type: ChangeType,
    /// Full resource for inserts, JSON patch array for updates, `null` otherwise
    pub payload: serde_json::Value,
    /// Last version of the resource observed from the server
    pub version_id: Option<String>,
    pub token: LocalChangeToken,
    /// Recording time (Unix ms)
    pub timestamp: i64,
}

impl LocalChange {
    /// Type and id of the changed resource
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type.clone(), self.resource_id.clone())
    }

    /// Version stamp with empty strings treated as absent
    #[must_use]
    pub fn known_version(&self) -> Option<&str> {
        self.version_id
            .as_deref()
            .map(str::trim)
            .filter(|version| !version.is_empty())
    }
}
