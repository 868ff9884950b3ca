//! The dynamic row-value type carried on the wire and bound into SQL statements.
//!
//! A watched table's columns are heterogeneous (integers, text, blobs, floats,
//! booleans stored as integers, timestamps, `NULL`). [`Value`] is the tagged
//! sum that survives a round trip through the [event codec](crate::codec)
//! without losing the discriminant, so the applier can bind parameters by
//! declared column type instead of guessing from a loosely-typed string.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// A single column value, tagged so encode/decode never lose the discriminant.
///
/// `Time` is kept distinct from `Text` even though SQLite has no native
/// timestamp type: the column descriptor's declared type decides whether a
/// `TEXT`/`INTEGER` column round-trips through `Time` (preserving
/// nanosecond precision) or through `Text`/`Integer` verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    /// RFC 3339 timestamp with nanosecond precision preserved.
    Time(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Read a value out of a live SQLite row/changelog column, given the
    /// column's declared type so `TEXT`/`INTEGER` columns tagged as
    /// timestamps decode into [`Value::Time`] rather than [`Value::Text`].
    pub fn from_sql(raw: ValueRef<'_>, declared_type: &str) -> rusqlite::Result<Self> {
        let is_time = declared_type.eq_ignore_ascii_case("DATETIME")
            || declared_type.eq_ignore_ascii_case("TIMESTAMP");
        Ok(match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => i64_to_value(i, declared_type),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => {
                let s = std::str::from_utf8(t)
                    .map_err(|e| rusqlite::Error::Utf8Error(e))?
                    .to_string();
                if is_time {
                    match DateTime::parse_from_rfc3339(&s) {
                        Ok(dt) => Value::Time(dt.with_timezone(&Utc)),
                        Err(_) => Value::Text(s),
                    }
                } else {
                    Value::Text(s)
                }
            }
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

fn i64_to_value(i: i64, declared_type: &str) -> Value {
    if declared_type.eq_ignore_ascii_case("BOOLEAN") || declared_type.eq_ignore_ascii_case("BOOL")
    {
        Value::Bool(i != 0)
    } else if declared_type.eq_ignore_ascii_case("DATETIME")
        || declared_type.eq_ignore_ascii_case("TIMESTAMP")
    {
        Value::Time(
            DateTime::from_timestamp_nanos(i).naive_utc().and_utc(),
        )
    } else {
        Value::Integer(i)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::Text(s) => ToSqlOutput::Owned(rusqlite::types::Value::Text(s.clone())),
            Value::Blob(b) => ToSqlOutput::Owned(rusqlite::types::Value::Blob(b.clone())),
            Value::Time(t) => ToSqlOutput::Owned(rusqlite::types::Value::Text(
                t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_round_trips_through_declared_type() {
        let v = i64_to_value(1, "BOOLEAN");
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn plain_integer_stays_integer() {
        let v = i64_to_value(42, "INTEGER");
        assert_eq!(v, Value::Integer(42));
    }

    #[test]
    fn null_is_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Integer(0).is_null());
    }
}
