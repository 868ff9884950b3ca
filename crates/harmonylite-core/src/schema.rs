//! Watched-table descriptors and the schema fingerprint.
//!
//! The fingerprint is the gate the [applier](crate::applier) checks before
//! writing any remote row: two nodes converge only while their watched
//! tables have byte-identical structural descriptors.

use sha2::{Digest, Sha256};

/// A single column of a watched table.
///
/// `pk_index` is `0` for non-key columns, else the 1-based position within
/// a composite primary key — this is what lets a multi-column PK be ordered
/// deterministically when it's encoded into a shard key or a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub pk_index: u32,
}

/// A user table the core must capture changes from and replicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedTable {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl WatchedTable {
    /// Introspect `name`'s structure via `PRAGMA table_info`, in the shape
    /// the change-log store and the fingerprint both need.
    pub fn introspect(conn: &rusqlite::Connection, name: &str) -> rusqlite::Result<Self> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{name}\")"))?;
        let mut columns = Vec::new();
        let rows = stmt.query_map([], |row| {
            let col_name: String = row.get(1)?;
            let declared_type: String = row.get(2)?;
            let notnull: i64 = row.get(3)?;
            let default: Option<String> = row.get(4)?;
            let pk_index: i64 = row.get(5)?;
            Ok(ColumnDescriptor {
                name: col_name,
                declared_type,
                nullable: notnull == 0,
                default,
                pk_index: pk_index as u32,
            })
        })?;
        for row in rows {
            columns.push(row?);
        }
        if columns.is_empty() {
            return Err(rusqlite::Error::QueryReturnedNoRows);
        }
        Ok(WatchedTable {
            name: name.to_string(),
            columns,
        })
    }

    /// Column names that form the primary key, ordered by `pk_index`.
    pub fn primary_key_columns(&self) -> Vec<&ColumnDescriptor> {
        let mut pk: Vec<&ColumnDescriptor> = self
            .columns
            .iter()
            .filter(|c| c.pk_index > 0)
            .collect();
        pk.sort_by_key(|c| c.pk_index);
        pk
    }
}

/// A fixed-width SHA-256 hash over the ordered descriptors of every watched
/// table. Equal iff all watched tables have identical structural descriptors
/// in identical order (tables sorted by name, columns sorted by name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaFingerprint(pub [u8; 32]);

impl SchemaFingerprint {
    pub fn compute(tables: &[WatchedTable]) -> Self {
        let mut sorted: Vec<&WatchedTable> = tables.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = Sha256::new();
        for table in sorted {
            hasher.update(table.name.as_bytes());
            hasher.update([0u8]);

            let mut columns: Vec<&ColumnDescriptor> = table.columns.iter().collect();
            columns.sort_by(|a, b| a.name.cmp(&b.name));

            for col in columns {
                hasher.update(col.name.as_bytes());
                hasher.update([0u8]);
                hasher.update(col.declared_type.as_bytes());
                hasher.update([0u8]);
                hasher.update([col.nullable as u8]);
                hasher.update(col.default.as_deref().unwrap_or("").as_bytes());
                hasher.update([0u8]);
                hasher.update(col.pk_index.to_le_bytes());
            }
        }

        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        SchemaFingerprint(out)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, ty: &str, pk: u32) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            declared_type: ty.to_string(),
            nullable: pk == 0,
            default: None,
            pk_index: pk,
        }
    }

    #[test]
    fn identical_tables_hash_equal_regardless_of_column_order() {
        let t1 = WatchedTable {
            name: "books".into(),
            columns: vec![col("id", "INTEGER", 1), col("title", "TEXT", 0)],
        };
        let t2 = WatchedTable {
            name: "books".into(),
            columns: vec![col("title", "TEXT", 0), col("id", "INTEGER", 1)],
        };
        assert_eq!(
            SchemaFingerprint::compute(&[t1]),
            SchemaFingerprint::compute(&[t2])
        );
    }

    #[test]
    fn table_order_does_not_matter() {
        let a = WatchedTable {
            name: "a".into(),
            columns: vec![col("id", "INTEGER", 1)],
        };
        let b = WatchedTable {
            name: "b".into(),
            columns: vec![col("id", "INTEGER", 1)],
        };
        assert_eq!(
            SchemaFingerprint::compute(&[a.clone(), b.clone()]),
            SchemaFingerprint::compute(&[b, a])
        );
    }

    #[test]
    fn different_types_hash_differently() {
        let a = WatchedTable {
            name: "t".into(),
            columns: vec![col("x", "INTEGER", 0)],
        };
        let b = WatchedTable {
            name: "t".into(),
            columns: vec![col("x", "TEXT", 0)],
        };
        assert_ne!(
            SchemaFingerprint::compute(&[a]),
            SchemaFingerprint::compute(&[b])
        );
    }

    #[test]
    fn primary_key_columns_ordered_by_index() {
        let t = WatchedTable {
            name: "t".into(),
            columns: vec![col("b", "TEXT", 2), col("a", "TEXT", 1)],
        };
        let pk = t.primary_key_columns();
        assert_eq!(pk[0].name, "a");
        assert_eq!(pk[1].name, "b");
    }
}
