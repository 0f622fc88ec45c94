//! Two-tier operation payload cache.
//!
//! - **Memory**: `DashMap` keyed by operation id, one JSON object per id
//! - **File**: `{dir}/{operation_id}` holding the same object, consulted on a
//!   memory miss and used to repopulate memory
//!
//! Fields are write-once. Re-writing a field with an identical value is a
//! no-op; a different value is rejected with `CacheConflict`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::OperationId;
use crate::error::{NodeError, Result};

/// Outcome of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// At least one new field was stored
    Written,
    /// Every field was already present with the same value
    Unchanged,
}

pub struct OperationCache {
    memory: DashMap<OperationId, Map<String, Value>>,
    dir: Option<PathBuf>,
    /// Serializes file-tier writes. Never held together with a map guard.
    file_lock: Mutex<()>,
    writes: AtomicU64,
}

impl OperationCache {
    /// Memory-only cache.
    pub fn in_memory() -> Self {
        Self {
            memory: DashMap::new(),
            dir: None,
            file_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
        }
    }

    /// Cache with a file tier under `dir`.
    pub fn with_dir(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            memory: DashMap::new(),
            dir: Some(dir.to_path_buf()),
            file_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
        })
    }

    /// Merge the fields of `payload` (a JSON object) into the entry for `id`.
    pub fn put(&self, id: OperationId, payload: Value) -> Result<CacheWrite> {
        let Value::Object(fields) = payload else {
            return Err(NodeError::Validation(
                "cached operation data must be an object".to_string(),
            ));
        };

        let loaded = if self.memory.contains_key(&id) {
            None
        } else {
            self.read_file(id)?
        };
        let mut entry = self.memory.entry(id).or_insert_with(|| loaded.unwrap_or_default());

        for (key, value) in &fields {
            if let Some(existing) = entry.get(key) {
                if existing != value {
                    return Err(NodeError::CacheConflict {
                        operation_id: id.to_string(),
                        field: key.clone(),
                    });
                }
            }
        }

        let mut changed = false;
        for (key, value) in fields {
            if !entry.contains_key(&key) {
                entry.insert(key, value);
                changed = true;
            }
        }
        drop(entry);

        if !changed {
            return Ok(CacheWrite::Unchanged);
        }

        self.persist(id)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(operation_id = %id, "Cached operation data");
        Ok(CacheWrite::Written)
    }

    /// Read the entry for `id`, falling back to the file tier.
    pub fn get(&self, id: OperationId) -> Result<Option<Value>> {
        if let Some(entry) = self.memory.get(&id) {
            return Ok(Some(Value::Object(entry.clone())));
        }
        match self.read_file(id)? {
            Some(fields) => {
                self.memory.entry(id).or_insert_with(|| fields.clone());
                Ok(Some(Value::Object(fields)))
            }
            None => Ok(None),
        }
    }

    /// Read a single field.
    pub fn get_field(&self, id: OperationId, field: &str) -> Result<Option<Value>> {
        Ok(self.get(id)?.and_then(|v| v.get(field).cloned()))
    }

    /// Drop the memory copy only. The file tier keeps serving reads.
    pub fn evict_memory(&self, id: OperationId) {
        self.memory.remove(&id);
    }

    /// Remove both tiers.
    pub fn remove(&self, id: OperationId) {
        self.memory.remove(&id);
        if let Some(path) = self.file_path(id) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(operation_id = %id, error = %e, "Failed to remove cache file");
                }
            }
        }
    }

    /// Number of writes that changed an entry.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    fn file_path(&self, id: OperationId) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(id.to_string()))
    }

    /// Write the current memory copy of `id` to the file tier.
    ///
    /// The snapshot is taken after the file lock is acquired, so the last
    /// writer always leaves the newest merge on disk.
    fn persist(&self, id: OperationId) -> Result<()> {
        let Some(path) = self.file_path(id) else {
            return Ok(());
        };
        let _guard = self
            .file_lock
            .lock()
            .map_err(|_| NodeError::Internal("operation cache file lock poisoned".to_string()))?;
        let snapshot = match self.memory.get(&id) {
            Some(entry) => serde_json::to_vec(&*entry)?,
            // removed meanwhile
            None => return Ok(()),
        };
        std::fs::write(&path, snapshot)?;
        Ok(())
    }

    fn read_file(&self, id: OperationId) -> Result<Option<Map<String, Value>>> {
        let Some(path) = self.file_path(id) else {
            return Ok(None);
        };
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
