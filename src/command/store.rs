//! SQLite-backed command store.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use super::{Command, CommandName, CommandStatus};
use crate::db::Database;
use crate::error::Result;

const COLUMNS: &str = "id, name, data, sequence, ready_at, delay, started_at, deadline_at, \
                       period, status, message, parent_id, transactional, retries, created_at";

#[derive(Clone)]
pub struct CommandStore {
    db: Database,
}

impl CommandStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new command and assign its id.
    pub fn insert(&self, command: &mut Command) -> Result<i64> {
        let conn = self.db.conn()?;
        insert_row(&conn, command)
    }

    pub fn get(&self, id: i64) -> Result<Option<Command>> {
        let conn = self.db.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM commands WHERE id = ?1", COLUMNS),
                [id],
                read_raw,
            )
            .optional()?;
        raw.map(RawCommand::into_command).transpose()
    }

    pub fn mark_started(&self, id: i64, started_at: u64) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE commands SET status = ?2, started_at = ?3 WHERE id = ?1",
            params![id, CommandStatus::Started.as_str(), started_at as i64],
        )?;
        Ok(())
    }

    /// Put a command back in line (retry or repeat).
    pub fn reschedule(
        &self,
        id: i64,
        status: CommandStatus,
        ready_at: u64,
        retries: u32,
        message: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE commands SET status = ?2, ready_at = ?3, retries = ?4, message = ?5 WHERE id = ?1",
            params![id, status.as_str(), ready_at as i64, retries, message],
        )?;
        Ok(())
    }

    pub fn set_status(&self, id: i64, status: CommandStatus, message: Option<&str>) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE commands SET status = ?2, message = ?3 WHERE id = ?1",
            params![id, status.as_str(), message],
        )?;
        Ok(())
    }

    /// Finish a command and insert its follow-ups in one transaction.
    pub fn finish_with_children(
        &self,
        id: i64,
        status: CommandStatus,
        message: Option<&str>,
        children: &mut [Command],
    ) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE commands SET status = ?2, message = ?3 WHERE id = ?1",
            params![id, status.as_str(), message],
        )?;
        for child in children.iter_mut() {
            child.parent_id = Some(id);
            insert_row(&tx, child)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Commands in any of `statuses`, oldest first. Rows whose name is no
    /// longer known are marked FAILED and skipped.
    pub fn find_by_status(&self, statuses: &[CommandStatus]) -> Result<Vec<Command>> {
        let conn = self.db.conn()?;
        let placeholders = (1..=statuses.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM commands WHERE status IN ({}) ORDER BY id",
            COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(names), read_raw)?;

        let mut commands = Vec::new();
        let mut unknown = Vec::new();
        for row in rows {
            let raw = row?;
            let id = raw.id;
            match raw.into_command() {
                Ok(cmd) => commands.push(cmd),
                Err(e) => {
                    warn!(command_id = id, error = %e, "Dropping unreadable command");
                    unknown.push(id);
                }
            }
        }
        drop(stmt);
        for id in unknown {
            conn.execute(
                "UPDATE commands SET status = 'FAILED', message = 'unknown command' WHERE id = ?1",
                [id],
            )?;
        }
        Ok(commands)
    }

    pub fn find_by_name(&self, name: CommandName) -> Result<Vec<Command>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM commands WHERE name = ?1 ORDER BY id",
            COLUMNS
        ))?;
        let rows = stmt.query_map([name.as_str()], read_raw)?;
        let mut commands = Vec::new();
        for row in rows {
            commands.push(row?.into_command()?);
        }
        Ok(commands)
    }

    pub fn delete_by_name(&self, name: CommandName) -> Result<usize> {
        let conn = self.db.conn()?;
        Ok(conn.execute("DELETE FROM commands WHERE name = ?1", [name.as_str()])?)
    }

    /// Delete finished commands created before `cutoff_ms`.
    pub fn sweep(&self, cutoff_ms: u64) -> Result<usize> {
        let conn = self.db.conn()?;
        Ok(conn.execute(
            "DELETE FROM commands
             WHERE status IN ('COMPLETED', 'FAILED', 'EXPIRED') AND created_at < ?1",
            [cutoff_ms as i64],
        )?)
    }
}

fn insert_row(conn: &Connection, command: &mut Command) -> Result<i64> {
    conn.execute(
        "INSERT INTO commands (name, data, sequence, ready_at, delay, started_at, deadline_at,
                               period, status, message, parent_id, transactional, retries, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            command.name.as_str(),
            serde_json::to_string(&command.data)?,
            serde_json::to_string(&command.sequence)?,
            command.ready_at as i64,
            command.delay_ms as i64,
            command.started_at.map(|t| t as i64),
            command.deadline_at.map(|t| t as i64),
            command.period_ms.map(|p| p as i64),
            command.status.as_str(),
            command.message,
            command.parent_id,
            command.transactional,
            command.retries,
            command.created_at as i64,
        ],
    )?;
    let id = conn.last_insert_rowid();
    command.id = Some(id);
    Ok(id)
}

struct RawCommand {
    id: i64,
    name: String,
    data: String,
    sequence: String,
    ready_at: i64,
    delay: i64,
    started_at: Option<i64>,
    deadline_at: Option<i64>,
    period: Option<i64>,
    status: String,
    message: Option<String>,
    parent_id: Option<i64>,
    transactional: bool,
    retries: u32,
    created_at: i64,
}

impl RawCommand {
    fn into_command(self) -> Result<Command> {
        Ok(Command {
            id: Some(self.id),
            name: self.name.parse()?,
            data: serde_json::from_str(&self.data)?,
            sequence: serde_json::from_str(&self.sequence)?,
            delay_ms: self.delay as u64,
            period_ms: self.period.map(|p| p as u64),
            retries: self.retries,
            deadline_at: self.deadline_at.map(|t| t as u64),
            transactional: self.transactional,
            status: self.status.parse()?,
            message: self.message,
            parent_id: self.parent_id,
            ready_at: self.ready_at as u64,
            started_at: self.started_at.map(|t| t as u64),
            created_at: self.created_at as u64,
        })
    }
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawCommand> {
    Ok(RawCommand {
        id: row.get(0)?,
        name: row.get(1)?,
        data: row.get(2)?,
        sequence: row.get(3)?,
        ready_at: row.get(4)?,
        delay: row.get(5)?,
        started_at: row.get(6)?,
        deadline_at: row.get(7)?,
        period: row.get(8)?,
        status: row.get(9)?,
        message: row.get(10)?,
        parent_id: row.get(11)?,
        transactional: row.get(12)?,
        retries: row.get(13)?,
        created_at: row.get(14)?,
    })
}
