//! Durable operation registry.
//!
//! Current status lives in `operations`; every accepted transition is also
//! appended to `operation_events`. Blockchain-scoped transitions keep their
//! own row in `operation_chain_status`.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use super::{OperationId, OperationKind, OperationRecord, OperationStatus, Origin};
use crate::db::Database;
use crate::error::{NodeError, Result};
use crate::time::now_millis;

/// One entry of an operation's status history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: OperationStatus,
    pub blockchain: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone)]
pub struct OperationRegistry {
    db: Database,
}

impl OperationRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new record. Fails if the id already exists.
    pub fn create(
        &self,
        id: OperationId,
        kind: OperationKind,
        status: OperationStatus,
        origin: Origin,
    ) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let now = now_millis();
        tx.execute(
            "INSERT INTO operations (operation_id, kind, status, origin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id.to_string(), kind.as_str(), status.to_string(), origin.as_str(), now as i64],
        )?;
        append_event(&tx, id, None, status, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a record unless one exists. Returns whether a row was created.
    pub fn create_if_absent(
        &self,
        id: OperationId,
        kind: OperationKind,
        status: OperationStatus,
        origin: Origin,
    ) -> Result<bool> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let now = now_millis();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO operations (operation_id, kind, status, origin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id.to_string(), kind.as_str(), status.to_string(), origin.as_str(), now as i64],
        )?;
        if inserted > 0 {
            append_event(&tx, id, None, status, now)?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    pub fn get(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        let conn = self.db.conn()?;
        load_record(&conn, id)
    }

    /// Apply a status transition.
    ///
    /// Returns `false` when the transition would regress or the operation is
    /// already terminal; nothing is written in that case. With a blockchain,
    /// the per-chain row advances independently and the main status follows
    /// when that keeps it monotone.
    pub fn update_status(
        &self,
        id: OperationId,
        blockchain: Option<&str>,
        status: OperationStatus,
    ) -> Result<bool> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let record = load_record(&tx, id)?
            .ok_or_else(|| NodeError::OperationNotFound(id.to_string()))?;
        let now = now_millis();

        let applied = match blockchain {
            None => {
                if !record.status.can_advance_to(&status) {
                    false
                } else {
                    set_status(&tx, id, status, now)?;
                    true
                }
            }
            Some(chain) => {
                if record.status.is_terminal() {
                    false
                } else {
                    let current: Option<String> = tx
                        .query_row(
                            "SELECT status FROM operation_chain_status
                             WHERE operation_id = ?1 AND blockchain = ?2",
                            params![id.to_string(), chain],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let chain_ok = match current {
                        Some(s) => s.parse::<OperationStatus>()?.can_advance_to(&status),
                        None => true,
                    };
                    if chain_ok {
                        tx.execute(
                            "INSERT INTO operation_chain_status (operation_id, blockchain, status, updated_at)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(operation_id, blockchain)
                             DO UPDATE SET status = ?3, updated_at = ?4",
                            params![id.to_string(), chain, status.to_string(), now as i64],
                        )?;
                        if record.status.can_advance_to(&status) {
                            set_status(&tx, id, status, now)?;
                        }
                    }
                    chain_ok
                }
            }
        };

        if applied {
            append_event(&tx, id, blockchain, status, now)?;
        }
        tx.commit()?;
        if applied {
            debug!(operation_id = %id, status = %status, blockchain = ?blockchain, "Operation status updated");
        }
        Ok(applied)
    }

    /// Move a non-terminal operation to FAILED with its error payload.
    pub fn mark_failed(&self, id: OperationId, data: &Value) -> Result<bool> {
        self.finish(id, OperationStatus::Failed, Some(data), false)
    }

    /// Move a non-terminal operation to COMPLETED.
    pub fn mark_completed(
        &self,
        id: OperationId,
        data: Option<&Value>,
        min_acks_reached: bool,
    ) -> Result<bool> {
        self.finish(id, OperationStatus::Completed, data, min_acks_reached)
    }

    fn finish(
        &self,
        id: OperationId,
        status: OperationStatus,
        data: Option<&Value>,
        min_acks_reached: bool,
    ) -> Result<bool> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let record = load_record(&tx, id)?
            .ok_or_else(|| NodeError::OperationNotFound(id.to_string()))?;
        if !record.status.can_advance_to(&status) {
            return Ok(false);
        }
        let now = now_millis();
        let data = data.map(serde_json::to_string).transpose()?;
        tx.execute(
            "UPDATE operations SET status = ?2, data = ?3, min_acks_reached = ?4, updated_at = ?5
             WHERE operation_id = ?1",
            params![id.to_string(), status.to_string(), data, min_acks_reached, now as i64],
        )?;
        append_event(&tx, id, None, status, now)?;
        tx.commit()?;
        debug!(operation_id = %id, status = %status, "Operation finished");
        Ok(true)
    }

    /// Status history, oldest first.
    pub fn events(&self, id: OperationId) -> Result<Vec<StatusEvent>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT status, blockchain, timestamp FROM operation_events
             WHERE operation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (status, blockchain, timestamp) = row?;
            events.push(StatusEvent {
                status: status.parse()?,
                blockchain,
                timestamp: timestamp as u64,
            });
        }
        Ok(events)
    }

    pub fn chain_status(&self, id: OperationId, blockchain: &str) -> Result<Option<OperationStatus>> {
        let conn = self.db.conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM operation_chain_status WHERE operation_id = ?1 AND blockchain = ?2",
                params![id.to_string(), blockchain],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    /// Delete terminal records last touched before `cutoff_ms` with their
    /// history. Returns the removed ids.
    pub fn sweep(&self, cutoff_ms: u64) -> Result<Vec<OperationId>> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT operation_id FROM operations
                 WHERE status IN ('COMPLETED', 'FAILED') AND updated_at < ?1",
            )?;
            let rows = stmt.query_map([cutoff_ms as i64], |row| row.get(0))?;
            let ids = rows.collect::<std::result::Result<Vec<String>, _>>()?;
            ids
        };
        for id in &ids {
            tx.execute("DELETE FROM operation_events WHERE operation_id = ?1", [id])?;
            tx.execute("DELETE FROM operation_chain_status WHERE operation_id = ?1", [id])?;
            tx.execute("DELETE FROM operations WHERE operation_id = ?1", [id])?;
        }
        tx.commit()?;
        ids.iter().map(|s| OperationId::parse(s)).collect()
    }
}

fn set_status(conn: &Connection, id: OperationId, status: OperationStatus, now: u64) -> Result<()> {
    conn.execute(
        "UPDATE operations SET status = ?2, updated_at = ?3 WHERE operation_id = ?1",
        params![id.to_string(), status.to_string(), now as i64],
    )?;
    Ok(())
}

fn append_event(
    conn: &Connection,
    id: OperationId,
    blockchain: Option<&str>,
    status: OperationStatus,
    now: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO operation_events (operation_id, blockchain, status, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), blockchain, status.to_string(), now as i64],
    )?;
    Ok(())
}

fn load_record(conn: &Connection, id: OperationId) -> Result<Option<OperationRecord>> {
    let raw = conn
        .query_row(
            "SELECT kind, status, origin, data, min_acks_reached, created_at, updated_at
             FROM operations WHERE operation_id = ?1",
            [id.to_string()],
            read_raw,
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(OperationRecord {
        operation_id: id,
        kind: raw.kind.parse()?,
        status: raw.status.parse()?,
        origin: raw.origin.parse()?,
        data: raw.data.map(|d| serde_json::from_str(&d)).transpose()?,
        min_acks_reached: raw.min_acks_reached,
        created_at: raw.created_at as u64,
        updated_at: raw.updated_at as u64,
    }))
}

struct RawRecord {
    kind: String,
    status: String,
    origin: String,
    data: Option<String>,
    min_acks_reached: bool,
    created_at: i64,
    updated_at: i64,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        kind: row.get(0)?,
        status: row.get(1)?,
        origin: row.get(2)?,
        data: row.get(3)?,
        min_acks_reached: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Phase;
    use serde_json::json;

    fn registry() -> OperationRegistry {
        OperationRegistry::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_status_never_regresses() {
        let reg = registry();
        let id = OperationId::new();
        let kind = OperationKind::Publish;
        reg.create(id, kind, OperationStatus::start(kind), Origin::Local).unwrap();

        assert!(reg
            .update_status(id, None, OperationStatus::phase(kind, Phase::ReplicateStart))
            .unwrap());
        assert!(!reg
            .update_status(id, None, OperationStatus::phase(kind, Phase::InitStart))
            .unwrap());

        let record = reg.get(id).unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::phase(kind, Phase::ReplicateStart));
        assert_eq!(reg.events(id).unwrap().len(), 2);
    }

    #[test]
    fn test_terminal_is_final() {
        let reg = registry();
        let id = OperationId::new();
        let kind = OperationKind::Get;
        reg.create(id, kind, OperationStatus::start(kind), Origin::Local).unwrap();

        assert!(reg
            .mark_failed(id, &json!({"errorMessage": "boom", "errorType": "GetNetworkError"}))
            .unwrap());
        assert!(!reg.mark_completed(id, None, true).unwrap());
        assert!(!reg
            .update_status(id, None, OperationStatus::phase(kind, Phase::FetchEnd))
            .unwrap());

        let record = reg.get(id).unwrap().unwrap();
        assert_eq!(record.status, OperationStatus::Failed);
        assert_eq!(record.data.unwrap()["errorMessage"], "boom");
    }

    #[test]
    fn test_chain_sub_status_is_independent() {
        let reg = registry();
        let id = OperationId::new();
        let kind = OperationKind::Publish;
        reg.create(id, kind, OperationStatus::start(kind), Origin::Local).unwrap();

        let replicate_end = OperationStatus::phase(kind, Phase::ReplicateEnd);
        let replicate_start = OperationStatus::phase(kind, Phase::ReplicateStart);
        assert!(reg.update_status(id, Some("chain-a"), replicate_end).unwrap());
        assert!(reg.update_status(id, Some("chain-b"), replicate_start).unwrap());

        assert_eq!(reg.chain_status(id, "chain-a").unwrap(), Some(replicate_end));
        assert_eq!(reg.chain_status(id, "chain-b").unwrap(), Some(replicate_start));
        assert_eq!(reg.get(id).unwrap().unwrap().status, replicate_end);
    }

    #[test]
    fn test_create_if_absent() {
        let reg = registry();
        let id = OperationId::new();
        let status = OperationStatus::start(OperationKind::Ask);
        assert!(reg.create_if_absent(id, OperationKind::Ask, status, Origin::Remote).unwrap());
        assert!(!reg.create_if_absent(id, OperationKind::Ask, status, Origin::Remote).unwrap());
    }

    #[test]
    fn test_sweep_only_removes_old_terminal_records() {
        let reg = registry();
        let done = OperationId::new();
        let running = OperationId::new();
        let kind = OperationKind::Ask;
        reg.create(done, kind, OperationStatus::start(kind), Origin::Local).unwrap();
        reg.create(running, kind, OperationStatus::start(kind), Origin::Local).unwrap();
        reg.mark_completed(done, None, false).unwrap();

        let removed = reg.sweep(now_millis() + 1).unwrap();
        assert_eq!(removed, vec![done]);
        assert!(reg.get(done).unwrap().is_none());
        assert!(reg.events(done).unwrap().is_empty());
        assert!(reg.get(running).unwrap().is_some());
    }
}
