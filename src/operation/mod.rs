//! Operation lifecycle: ids, kinds, durable status registry and payload cache.

pub mod cache;
pub mod registry;
pub mod service;
pub mod status;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NodeError;

pub use cache::{CacheWrite, OperationCache};
pub use registry::OperationRegistry;
pub use service::{OperationResult, OperationService};
pub use status::{OperationStatus, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Publish,
    Get,
    Update,
    Ask,
    Finality,
    Query,
    LocalStore,
    Search,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Publish,
        OperationKind::Get,
        OperationKind::Update,
        OperationKind::Ask,
        OperationKind::Finality,
        OperationKind::Query,
        OperationKind::LocalStore,
        OperationKind::Search,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Publish => "publish",
            OperationKind::Get => "get",
            OperationKind::Update => "update",
            OperationKind::Ask => "ask",
            OperationKind::Finality => "finality",
            OperationKind::Query => "query",
            OperationKind::LocalStore => "local_store",
            OperationKind::Search => "search",
        }
    }

    /// Upper-case prefix used in status strings.
    pub fn status_prefix(&self) -> &'static str {
        match self {
            OperationKind::Publish => "PUBLISH",
            OperationKind::Get => "GET",
            OperationKind::Update => "UPDATE",
            OperationKind::Ask => "ASK",
            OperationKind::Finality => "FINALITY",
            OperationKind::Query => "QUERY",
            OperationKind::LocalStore => "LOCAL_STORE",
            OperationKind::Search => "SEARCH",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('-', "_").to_ascii_lowercase();
        OperationKind::ALL
            .iter()
            .find(|k| k.as_str() == normalized)
            .copied()
            .ok_or_else(|| NodeError::Validation(format!("unsupported operation kind {}", s)))
    }
}

/// Who created the operation record on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Origin {
    /// A client call on this node
    Local,
    /// An inbound protocol message from a peer
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "LOCAL",
            Origin::Remote => "REMOTE",
        }
    }
}

impl FromStr for Origin {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOCAL" => Ok(Origin::Local),
            "REMOTE" => Ok(Origin::Remote),
            other => Err(NodeError::Validation(format!("unknown origin {}", other))),
        }
    }
}

/// Validated operation identifier (hyphenated UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Checks the textual form before it is used in any lookup.
    pub fn is_valid(s: &str) -> bool {
        s.len() == 36 && Uuid::try_parse(s).is_ok()
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        if !Self::is_valid(s) {
            return Err(NodeError::InvalidOperationId(s.to_string()));
        }
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|_| NodeError::InvalidOperationId(s.to_string()))
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for OperationId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OperationId {
    type Error = NodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> Self {
        id.to_string()
    }
}

/// Row of the operation registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub origin: Origin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub min_acks_reached: bool,
    pub created_at: u64,
    pub updated_at: u64,
}
