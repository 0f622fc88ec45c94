//! Finality acknowledgements: which peers confirmed storing a published UAL.

use rusqlite::params;
use tracing::debug;

use crate::collaborators::PeerId;
use crate::db::Database;
use crate::error::Result;
use crate::operation::OperationId;
use crate::time::now_millis;

#[derive(Clone)]
pub struct FinalityStore {
    db: Database,
}

impl FinalityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record an acknowledgement. Returns `false` for a duplicate.
    pub fn record(&self, publish_operation_id: OperationId, ual: &str, peer_id: &PeerId) -> Result<bool> {
        let conn = self.db.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO finality_acks (publish_operation_id, ual, peer_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                publish_operation_id.to_string(),
                ual,
                peer_id.as_str(),
                now_millis() as i64
            ],
        )?;
        debug!(publish_operation_id = %publish_operation_id, ual, peer = %peer_id, inserted, "Finality ack");
        Ok(inserted > 0)
    }

    /// Number of distinct peers that acknowledged `ual`.
    pub fn count_for_ual(&self, ual: &str) -> Result<u64> {
        let conn = self.db.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT peer_id) FROM finality_acks WHERE ual = ?1",
            [ual],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_for_operation(&self, publish_operation_id: OperationId) -> Result<u64> {
        let conn = self.db.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM finality_acks WHERE publish_operation_id = ?1",
            [publish_operation_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let store = FinalityStore::new(Database::open_in_memory().unwrap());
        let op = OperationId::new();
        let peer = PeerId::from("peer-b");

        assert!(store.record(op, "did:dkg:c/0x1/1", &peer).unwrap());
        assert!(!store.record(op, "did:dkg:c/0x1/1", &peer).unwrap());
        assert!(store.record(op, "did:dkg:c/0x1/1", &PeerId::from("peer-c")).unwrap());

        assert_eq!(store.count_for_operation(op).unwrap(), 2);
        assert_eq!(store.count_for_ual("did:dkg:c/0x1/1").unwrap(), 2);
    }
}
