//! Pending storage for updates that are not finalized on chain yet.
//!
//! Keyed by (UAL, assertion id). Entries live in memory and, when a directory
//! is configured, as JSON files so a restart keeps them.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;
use crate::operation::OperationId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingState {
    pub ual: String,
    pub assertion_id: String,
    pub nquads: Vec<String>,
    pub operation_id: OperationId,
    pub keyword: String,
    pub created_at: u64,
}

pub struct PendingStorage {
    entries: DashMap<(String, String), PendingState>,
    dir: Option<PathBuf>,
}

impl PendingStorage {
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            dir: None,
        }
    }

    /// File-backed storage; existing entries under `dir` are loaded.
    pub fn with_dir(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let entries = DashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            match std::fs::read(&path)
                .map_err(crate::error::NodeError::from)
                .and_then(|b| Ok(serde_json::from_slice::<PendingState>(&b)?))
            {
                Ok(state) => {
                    entries.insert((state.ual.clone(), state.assertion_id.clone()), state);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable pending state"),
            }
        }
        Ok(Self {
            entries,
            dir: Some(dir.to_path_buf()),
        })
    }

    /// Store a pending state. Identical re-stores are no-ops.
    pub fn cache(&self, state: PendingState) -> Result<bool> {
        let key = (state.ual.clone(), state.assertion_id.clone());
        if self.entries.get(&key).map(|e| *e == state).unwrap_or(false) {
            return Ok(false);
        }
        if let Some(path) = self.file_path(&state.ual, &state.assertion_id) {
            std::fs::write(path, serde_json::to_vec(&state)?)?;
        }
        debug!(ual = %state.ual, assertion_id = %state.assertion_id, "Pending state cached");
        self.entries.insert(key, state);
        Ok(true)
    }

    pub fn get(&self, ual: &str, assertion_id: &str) -> Option<PendingState> {
        self.entries
            .get(&(ual.to_string(), assertion_id.to_string()))
            .map(|e| e.clone())
    }

    /// Most recent pending state for `ual`, whatever its assertion.
    pub fn latest(&self, ual: &str) -> Option<PendingState> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == ual)
            .max_by_key(|e| e.value().created_at)
            .map(|e| e.value().clone())
    }

    pub fn remove(&self, ual: &str, assertion_id: &str) -> Result<bool> {
        let removed = self
            .entries
            .remove(&(ual.to_string(), assertion_id.to_string()))
            .is_some();
        if let Some(path) = self.file_path(ual, assertion_id) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn file_path(&self, ual: &str, assertion_id: &str) -> Option<PathBuf> {
        let digest = Sha256::digest(format!("{}|{}", ual, assertion_id).as_bytes());
        self.dir.as_ref().map(|d| d.join(hex::encode(digest)))
    }
}
