//! SQLite persistence shared by the operation registry, command store and
//! finality bookkeeping.
//!
//! One connection guarded by a mutex. Every statement is short and never held
//! across an await point.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::info;

use crate::error::{NodeError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS operations (
    operation_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    origin TEXT NOT NULL,
    data TEXT,
    min_acks_reached INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_operations_updated ON operations(updated_at);

CREATE TABLE IF NOT EXISTS operation_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id TEXT NOT NULL,
    blockchain TEXT,
    status TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_operation_events_op ON operation_events(operation_id);

CREATE TABLE IF NOT EXISTS operation_chain_status (
    operation_id TEXT NOT NULL,
    blockchain TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (operation_id, blockchain)
);

CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    sequence TEXT NOT NULL,
    ready_at INTEGER NOT NULL,
    delay INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER,
    deadline_at INTEGER,
    period INTEGER,
    status TEXT NOT NULL,
    message TEXT,
    parent_id INTEGER,
    transactional INTEGER NOT NULL DEFAULT 0,
    retries INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_commands_status ON commands(status);
CREATE INDEX IF NOT EXISTS idx_commands_name ON commands(name);
CREATE INDEX IF NOT EXISTS idx_commands_started ON commands(started_at);

CREATE TABLE IF NOT EXISTS finality_acks (
    publish_operation_id TEXT NOT NULL,
    ual TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (publish_operation_id, ual, peer_id)
);
CREATE INDEX IF NOT EXISTS idx_finality_acks_ual ON finality_acks(ual);
";

/// Handle to the node database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self::with_connection(conn)?;
        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection for a short synchronous section.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| NodeError::Internal("database mutex poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_reapplied_safely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn()
                .unwrap()
                .execute(
                    "INSERT INTO finality_acks VALUES ('op', 'ual', 'peer', 0)",
                    [],
                )
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM finality_acks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
