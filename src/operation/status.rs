//! Operation status values.
//!
//! Every kind walks the same phase ladder, rendered as `<KIND>_<PHASE>`
//! (e.g. `PUBLISH_REPLICATE_START`). `COMPLETED` and `FAILED` are shared by
//! all kinds and are final.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::OperationKind;
use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    InitStart,
    InitEnd,
    ValidateAssertionStart,
    ValidateAssertionEnd,
    LocalStart,
    LocalEnd,
    FindNodesStart,
    FindNodesEnd,
    ReplicateStart,
    ReplicateEnd,
    FetchStart,
    FetchEnd,
    RemoteInitStart,
    RemoteInitEnd,
    RemoteRequestStart,
    RemoteRequestEnd,
}

impl Phase {
    const ALL: [Phase; 17] = [
        Phase::Start,
        Phase::InitStart,
        Phase::InitEnd,
        Phase::ValidateAssertionStart,
        Phase::ValidateAssertionEnd,
        Phase::LocalStart,
        Phase::LocalEnd,
        Phase::FindNodesStart,
        Phase::FindNodesEnd,
        Phase::ReplicateStart,
        Phase::ReplicateEnd,
        Phase::FetchStart,
        Phase::FetchEnd,
        Phase::RemoteInitStart,
        Phase::RemoteInitEnd,
        Phase::RemoteRequestStart,
        Phase::RemoteRequestEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "START",
            Phase::InitStart => "INIT_START",
            Phase::InitEnd => "INIT_END",
            Phase::ValidateAssertionStart => "VALIDATE_ASSERTION_START",
            Phase::ValidateAssertionEnd => "VALIDATE_ASSERTION_END",
            Phase::LocalStart => "LOCAL_START",
            Phase::LocalEnd => "LOCAL_END",
            Phase::FindNodesStart => "FIND_NODES_START",
            Phase::FindNodesEnd => "FIND_NODES_END",
            Phase::ReplicateStart => "REPLICATE_START",
            Phase::ReplicateEnd => "REPLICATE_END",
            Phase::FetchStart => "FETCH_START",
            Phase::FetchEnd => "FETCH_END",
            Phase::RemoteInitStart => "REMOTE_INIT_START",
            Phase::RemoteInitEnd => "REMOTE_INIT_END",
            Phase::RemoteRequestStart => "REMOTE_REQUEST_START",
            Phase::RemoteRequestEnd => "REMOTE_REQUEST_END",
        }
    }

    fn rank(&self) -> u16 {
        match self {
            Phase::Start => 0,
            Phase::InitStart => 10,
            Phase::InitEnd => 11,
            Phase::ValidateAssertionStart => 20,
            Phase::ValidateAssertionEnd => 21,
            Phase::LocalStart => 30,
            Phase::LocalEnd => 31,
            Phase::FindNodesStart => 40,
            Phase::FindNodesEnd => 41,
            Phase::ReplicateStart => 50,
            Phase::ReplicateEnd => 51,
            Phase::FetchStart => 52,
            Phase::FetchEnd => 53,
            Phase::RemoteInitStart => 60,
            Phase::RemoteInitEnd => 61,
            Phase::RemoteRequestStart => 62,
            Phase::RemoteRequestEnd => 63,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Phase(OperationKind, Phase),
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn phase(kind: OperationKind, phase: Phase) -> Self {
        OperationStatus::Phase(kind, phase)
    }

    pub fn start(kind: OperationKind) -> Self {
        OperationStatus::Phase(kind, Phase::Start)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    /// Position on the ladder; terminal statuses sit above every phase.
    pub fn rank(&self) -> u16 {
        match self {
            OperationStatus::Phase(_, phase) => phase.rank(),
            OperationStatus::Completed => 1000,
            OperationStatus::Failed => 1001,
        }
    }

    /// Whether moving from `self` to `next` keeps the ladder monotone.
    /// FAILED is reachable from any non-terminal status.
    pub fn can_advance_to(&self, next: &OperationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *next == OperationStatus::Failed {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Phase(kind, phase) => {
                write!(f, "{}_{}", kind.status_prefix(), phase.as_str())
            }
            OperationStatus::Completed => f.write_str("COMPLETED"),
            OperationStatus::Failed => f.write_str("FAILED"),
        }
    }
}

impl FromStr for OperationStatus {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => return Ok(OperationStatus::Completed),
            "FAILED" => return Ok(OperationStatus::Failed),
            _ => {}
        }
        // LOCAL_STORE has to be tried before shorter prefixes could match
        let mut kinds = OperationKind::ALL.to_vec();
        kinds.sort_by_key(|k| std::cmp::Reverse(k.status_prefix().len()));
        for kind in kinds {
            let Some(rest) = s
                .strip_prefix(kind.status_prefix())
                .and_then(|r| r.strip_prefix('_'))
            else {
                continue;
            };
            if let Some(phase) = Phase::ALL.iter().find(|p| p.as_str() == rest) {
                return Ok(OperationStatus::Phase(kind, *phase));
            }
        }
        Err(NodeError::Validation(format!("unknown operation status {}", s)))
    }
}

impl Serialize for OperationStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OperationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
