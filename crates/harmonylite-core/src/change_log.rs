//! Change-log store: the auxiliary table + trigger trio installed per
//! watched table, and the session-scoped suppress-triggers guard the
//! [applier](crate::applier) uses to avoid echoing its own writes back
//! into the log.

use std::time::Duration;

use rusqlite::Connection;

use crate::error::{HarmonyError, Result};
use crate::schema::WatchedTable;

fn log_table_name(table: &str) -> String {
    format!("__harmonylite__{table}_change_log")
}

fn trigger_name(table: &str, event: &str) -> String {
    format!("__harmonylite__{table}_change_log_on_{event}")
}

/// One row of a watched table's auxiliary change-log table.
#[derive(Debug, Clone)]
pub struct ChangeLogRow {
    pub id: i64,
    pub change_type: String,
    pub published: bool,
    pub columns: Vec<(String, rusqlite::types::Value)>,
}

/// Install (or re-create) the auxiliary table and triggers for every table
/// in `tables`. Idempotent: existing triggers for a table are dropped and
/// recreated so the shadow schema always matches the table's current
/// columns. The whole install runs inside one transaction — if any
/// statement fails, nothing is left half-applied.
pub fn install(conn: &Connection, tables: &[WatchedTable]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for table in tables {
        install_one(&tx, table)?;
    }
    tx.commit()?;
    Ok(())
}

fn install_one(conn: &Connection, table: &WatchedTable) -> Result<()> {
    let log_table = log_table_name(&table.name);

    conn.execute(&format!(r#"DROP TABLE IF EXISTS "{log_table}""#), [])?;
    for event in ["insert", "update", "delete"] {
        conn.execute(
            &format!(
                r#"DROP TRIGGER IF EXISTS "{}""#,
                trigger_name(&table.name, event)
            ),
            [],
        )?;
    }

    let shadow_cols: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!(r#""{}" {}"#, c.name, c.declared_type))
        .collect();
    conn.execute(
        &format!(
            r#"CREATE TABLE "{log_table}" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                change_type TEXT NOT NULL,
                published BOOLEAN NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                {cols}
            )"#,
            cols = shadow_cols.join(",\n                ")
        ),
        [],
    )?;

    let col_names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    let insert_cols = col_names
        .iter()
        .map(|c| format!(r#""{c}""#))
        .collect::<Vec<_>>()
        .join(", ");

    let new_values = col_names
        .iter()
        .map(|c| format!(r#"NEW."{c}""#))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            r#"CREATE TRIGGER "{trig}" AFTER INSERT ON "{table}"
               WHEN (SELECT value FROM __harmonylite__suppress_triggers WHERE rowid = 1) = 0
               BEGIN
                   INSERT INTO "{log_table}" (change_type, published, {insert_cols})
                   VALUES ('insert', 0, {new_values});
               END"#,
            trig = trigger_name(&table.name, "insert"),
            table = table.name,
        ),
        [],
    )?;
    conn.execute(
        &format!(
            r#"CREATE TRIGGER "{trig}" AFTER UPDATE ON "{table}"
               WHEN (SELECT value FROM __harmonylite__suppress_triggers WHERE rowid = 1) = 0
               BEGIN
                   INSERT INTO "{log_table}" (change_type, published, {insert_cols})
                   VALUES ('update', 0, {new_values});
               END"#,
            trig = trigger_name(&table.name, "update"),
            table = table.name,
        ),
        [],
    )?;
    let old_values = col_names
        .iter()
        .map(|c| format!(r#"OLD."{c}""#))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            r#"CREATE TRIGGER "{trig}" AFTER DELETE ON "{table}"
               WHEN (SELECT value FROM __harmonylite__suppress_triggers WHERE rowid = 1) = 0
               BEGIN
                   INSERT INTO "{log_table}" (change_type, published, {insert_cols})
                   VALUES ('delete', 0, {old_values});
               END"#,
            trig = trigger_name(&table.name, "delete"),
            table = table.name,
        ),
        [],
    )?;

    Ok(())
}

/// Drop every auxiliary table and trigger this module installed for
/// `tables`. Best-effort per table; does not fail if a table was never
/// installed.
pub fn remove_all(conn: &Connection, tables: &[WatchedTable]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for table in tables {
        for event in ["insert", "update", "delete"] {
            tx.execute(
                &format!(
                    r#"DROP TRIGGER IF EXISTS "{}""#,
                    trigger_name(&table.name, event)
                ),
                [],
            )?;
        }
        tx.execute(
            &format!(
                r#"DROP TABLE IF EXISTS "{}""#,
                log_table_name(&table.name)
            ),
            [],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Ensure the single-row suppress-triggers control table exists, defaulted
/// to `0` (triggers active). Call once per connection at startup.
pub fn ensure_suppress_control(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS __harmonylite__suppress_triggers (rowid INTEGER PRIMARY KEY CHECK (rowid = 1), value INTEGER NOT NULL)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO __harmonylite__suppress_triggers (rowid, value) VALUES (1, 0)",
        [],
    )?;
    Ok(())
}

/// Set the suppress-triggers flag on `conn` for the duration of `f`, always
/// clearing it afterward even if `f` fails. Used by the applier to execute
/// a single remote write without re-logging it.
pub fn with_triggers_suppressed<T>(
    conn: &Connection,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute(
        "UPDATE __harmonylite__suppress_triggers SET value = 1 WHERE rowid = 1",
        [],
    )?;
    let result = f();
    conn.execute(
        "UPDATE __harmonylite__suppress_triggers SET value = 0 WHERE rowid = 1",
        [],
    )?;
    result
}

/// Read up to `limit` unpublished rows from `table`'s change log, ordered by
/// id. Returns an empty vec once the log is drained.
pub fn unpublished(
    conn: &Connection,
    table: &WatchedTable,
    limit: usize,
) -> Result<Vec<ChangeLogRow>> {
    let log_table = log_table_name(&table.name);
    let col_names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    let select_cols = col_names
        .iter()
        .map(|c| format!(r#""{c}""#))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        r#"SELECT id, change_type, {select_cols} FROM "{log_table}"
           WHERE published = 0 ORDER BY id ASC LIMIT ?1"#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit as i64], |row| {
        let id: i64 = row.get(0)?;
        let change_type: String = row.get(1)?;
        let mut columns = Vec::with_capacity(col_names.len());
        for (i, name) in col_names.iter().enumerate() {
            let value: rusqlite::types::Value = row.get(i + 2)?;
            columns.push((name.to_string(), value));
        }
        Ok(ChangeLogRow {
            id,
            change_type,
            published: false,
            columns,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Mark the given change-log ids as published so [`unpublished`] skips them.
pub fn mark_published(conn: &Connection, table: &WatchedTable, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let log_table = log_table_name(&table.name);
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(r#"UPDATE "{log_table}" SET published = 1 WHERE id IN ({placeholders})"#);
    let params: Vec<&dyn rusqlite::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
    conn.execute(&sql, params.as_slice())
        .map_err(HarmonyError::from)?;
    Ok(())
}

/// Delete published rows recorded more than `retain_for` ago, per table.
/// Called on the cleanup ticker.
pub fn cleanup(conn: &Connection, table: &WatchedTable, retain_for: Duration) -> Result<usize> {
    let log_table = log_table_name(&table.name);
    let cutoff_modifier = format!("-{} seconds", retain_for.as_secs());
    let deleted = conn.execute(
        &format!(
            r#"DELETE FROM "{log_table}" WHERE published = 1
               AND recorded_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?1)"#
        ),
        [cutoff_modifier],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDescriptor;

    fn books_table() -> WatchedTable {
        WatchedTable {
            name: "books".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".into(),
                    declared_type: "INTEGER".into(),
                    nullable: false,
                    default: None,
                    pk_index: 1,
                },
                ColumnDescriptor {
                    name: "title".into(),
                    declared_type: "TEXT".into(),
                    nullable: true,
                    default: None,
                    pk_index: 0,
                },
            ],
        }
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT)",
            [],
        )
        .unwrap();
        ensure_suppress_control(&conn).unwrap();
        conn
    }

    #[test]
    fn insert_is_captured_by_trigger() {
        let conn = setup();
        install(&conn, &[books_table()]).unwrap();
        conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();

        let rows = unpublished(&conn, &books_table(), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_type, "insert");
    }

    #[test]
    fn suppressed_writes_do_not_log() {
        let conn = setup();
        install(&conn, &[books_table()]).unwrap();

        with_triggers_suppressed(&conn, || {
            conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])?;
            Ok(())
        })
        .unwrap();

        let rows = unpublished(&conn, &books_table(), 10).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn mark_published_excludes_from_unpublished() {
        let conn = setup();
        install(&conn, &[books_table()]).unwrap();
        conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();

        let rows = unpublished(&conn, &books_table(), 10).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        mark_published(&conn, &books_table(), &ids).unwrap();

        assert!(unpublished(&conn, &books_table(), 10).unwrap().is_empty());
    }

    #[test]
    fn delete_trigger_captures_old_values() {
        let conn = setup();
        install(&conn, &[books_table()]).unwrap();
        conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();
        let rows = unpublished(&conn, &books_table(), 10).unwrap();
        mark_published(&conn, &books_table(), &[rows[0].id]).unwrap();

        conn.execute("DELETE FROM books WHERE id = 1", []).unwrap();
        let rows = unpublished(&conn, &books_table(), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_type, "delete");
        let title = rows[0]
            .columns
            .iter()
            .find(|(n, _)| n == "title")
            .unwrap();
        assert_eq!(
            title.1,
            rusqlite::types::Value::Text("Dune".to_string())
        );
    }

    #[test]
    fn reinstall_is_idempotent() {
        let conn = setup();
        install(&conn, &[books_table()]).unwrap();
        install(&conn, &[books_table()]).unwrap();
        conn.execute("INSERT INTO books (id, title) VALUES (1, 'Dune')", [])
            .unwrap();
        assert_eq!(unpublished(&conn, &books_table(), 10).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_deletes_published_rows_older_than_the_retention_window() {
        let conn = setup();
        install(&conn, &[books_table()]).unwrap();
        for i in 1..=5 {
            conn.execute(
                "INSERT INTO books (id, title) VALUES (?1, 'x')",
                [i],
            )
            .unwrap();
        }
        let rows = unpublished(&conn, &books_table(), 10).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        mark_published(&conn, &books_table(), &ids).unwrap();

        // Nothing is older than a generous retention window yet.
        let deleted = cleanup(&conn, &books_table(), Duration::from_secs(3600)).unwrap();
        assert_eq!(deleted, 0);

        // A zero-second window treats every already-published row as expired.
        let deleted = cleanup(&conn, &books_table(), Duration::from_secs(0)).unwrap();
        assert_eq!(deleted, 5);
    }
}
