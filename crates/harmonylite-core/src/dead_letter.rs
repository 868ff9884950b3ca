//! Dead-letter record: a local-only table of rows that matched
//! schema but failed to apply. Never replicated — purely an operator
//! inspection aid, recorded so an otherwise-fatal applier error doesn't
//! block the shard it arrived on.

use chrono::Utc;
use rusqlite::Connection;

use crate::envelope::NodeId;
use crate::error::{HarmonyError, Result};

pub fn ensure_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS __harmonylite__dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            primary_key TEXT NOT NULL,
            reason TEXT NOT NULL,
            originating_node INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: i64,
    pub table_name: String,
    pub primary_key: String,
    pub reason: String,
    pub originating_node: NodeId,
    pub recorded_at: chrono::DateTime<Utc>,
}

/// Record a dead letter. Best-effort: callers already log a warning; a
/// failure here is surfaced to the caller but never escalated further
/// (losing a dead-letter record is preferable to blocking the shard).
pub fn record(
    conn: &Connection,
    table_name: &str,
    primary_key: &str,
    reason: &str,
    originating_node: NodeId,
) -> Result<()> {
    conn.execute(
        "INSERT INTO __harmonylite__dead_letters
            (table_name, primary_key, reason, originating_node, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            table_name,
            primary_key,
            reason,
            originating_node as i64,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(HarmonyError::from)?;
    Ok(())
}

/// List dead letters for operator inspection, most recent first.
pub fn list(conn: &Connection, limit: usize) -> Result<Vec<DeadLetter>> {
    let mut stmt = conn.prepare(
        "SELECT id, table_name, primary_key, reason, originating_node, recorded_at
         FROM __harmonylite__dead_letters ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        let recorded_at: String = row.get(5)?;
        Ok(DeadLetter {
            id: row.get(0)?,
            table_name: row.get(1)?,
            primary_key: row.get(2)?,
            reason: row.get(3)?,
            originating_node: row.get::<_, i64>(4)? as NodeId,
            recorded_at: chrono::DateTime::parse_from_rfc3339(&recorded_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
