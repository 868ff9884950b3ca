//! Change Reader: drains unpublished rows out of each watched
//! table's change-log and hydrates them into [`ChangeEvent`]s. Marking a row
//! published is the caller's job, done only after the event has actually
//! been handed to the publisher, so a row is never lost between the two
//! steps. Driven primarily by the connection's `update_hook` wake signal,
//! with a polling interval as a fallback for the rare case a hook misfires.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::Connection;
use rusqlite::types::ValueRef;

use crate::change_log::{self, ChangeLogRow};
use crate::envelope::{ChangeEvent, ChangeType};
use crate::error::Result;
use crate::schema::{SchemaFingerprint, WatchedTable};
use crate::value::Value;

/// Caps the number of rows drained per wake, per table, so one burst of
/// writes can't starve other tables' scans or block the reader loop
/// indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    pub scan_max_changes: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            scan_max_changes: 500,
        }
    }
}

/// Hydrate up to `config.scan_max_changes` unpublished rows from `table`
/// into events, in local-id order. Does not mark them published — the
/// caller does that, one event at a time, only once it has actually reached
/// the publisher.
pub fn drain_table(
    conn: &Connection,
    table: &WatchedTable,
    config: &ReaderConfig,
    current_fingerprint: SchemaFingerprint,
) -> Result<Vec<ChangeEvent>> {
    let rows = change_log::unpublished(conn, table, config.scan_max_changes)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let declared_types: BTreeMap<&str, &str> = table
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.declared_type.as_str()))
        .collect();

    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        events.push(hydrate(row, table, &declared_types, current_fingerprint)?);
    }

    Ok(events)
}

fn hydrate(
    row: &ChangeLogRow,
    table: &WatchedTable,
    declared_types: &BTreeMap<&str, &str>,
    fingerprint: SchemaFingerprint,
) -> Result<ChangeEvent> {
    let change_type = ChangeType::parse(&row.change_type).unwrap_or(ChangeType::Insert);

    let mut values = BTreeMap::new();
    for (name, raw) in &row.columns {
        let declared = declared_types.get(name.as_str()).copied().unwrap_or("");
        let value = match raw {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(i) => {
                Value::from_sql(ValueRef::Integer(*i), declared)?
            }
            rusqlite::types::Value::Real(f) => Value::from_sql(ValueRef::Real(*f), declared)?,
            rusqlite::types::Value::Text(s) => Value::from_sql(ValueRef::Text(s.as_bytes()), declared)?,
            rusqlite::types::Value::Blob(b) => Value::from_sql(ValueRef::Blob(b), declared)?,
        };
        values.insert(name.clone(), value);
    }

    Ok(ChangeEvent {
        id: row.id,
        change_type,
        table_name: table.name.clone(),
        row: values,
        table_hash: fingerprint.0,
    })
}

/// Register an `update_hook` on `conn` that pushes a wake signal to `notify`
/// whenever any watched table changes. The hook itself carries no row data
/// — the reader re-scans the change-log tables on wake, it doesn't try to
/// reconstruct the row from the hook's arguments.
pub fn install_update_hook(conn: &Connection, notify: Arc<tokio::sync::Notify>) {
    conn.update_hook(Some(move |_action, _db: &str, _table: &str, _rowid: i64| {
        notify.notify_one();
    }));
}
