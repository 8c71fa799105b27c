//! Bundled SQLite backend.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ErrorCode};

use super::{Batch, Database, DbError, DbResult};
use crate::value::Value;

/// A SQLite target database.
pub struct SqliteDb {
    conn: Connection,
}

impl SqliteDb {
    /// Open or create a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(map_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_err)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> DbResult<()> {
        // FK enforcement is off by default in SQLite.
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(map_err)?;
        Ok(())
    }
}

impl Database for SqliteDb {
    fn execute(&mut self, sql: &str) -> DbResult<usize> {
        self.conn.execute(sql, []).map_err(map_err)
    }

    fn query(&mut self, sql: &str) -> DbResult<Batch> {
        let mut stmt = self.conn.prepare(sql).map_err(map_err)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        let mut rows = Vec::new();
        let mut raw = stmt.query([]).map_err(map_err)?;
        while let Some(row) = raw.next().map_err(map_err)? {
            let mut out = Vec::with_capacity(columns.len());
            for ix in 0..columns.len() {
                out.push(from_ref(row.get_ref(ix).map_err(map_err)?));
            }
            rows.push(out);
        }
        Ok(Batch { columns, rows })
    }

    fn copy_in(&mut self, table: &str, columns: &[String], tsv: &str) -> DbResult<usize> {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );

        let tx = self.conn.transaction().map_err(map_err)?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(&sql).map_err(map_err)?;
            for line in tsv.lines() {
                if line.is_empty() {
                    continue;
                }
                let fields: Vec<Value> = line.split('\t').map(parse_tsv_field).collect();
                if fields.len() != columns.len() {
                    return Err(DbError::Shape(format!(
                        "TSV row has {} fields, expected {}",
                        fields.len(),
                        columns.len()
                    )));
                }
                stmt.execute(params_from_iter(fields.iter().map(to_sql)))
                    .map_err(map_err)?;
                count += 1;
            }
        }
        tx.commit().map_err(map_err)?;
        Ok(count)
    }

    fn schema_snapshot(&mut self) -> DbResult<BTreeMap<String, BTreeSet<String>>> {
        let tables: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                )
                .map_err(map_err)?;
            let names = stmt
                .query_map([], |row| row.get(0))
                .map_err(map_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(map_err)?;
            names
        };

        let mut snapshot = BTreeMap::new();
        for table in tables {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({})", table))
                .map_err(map_err)?;
            let columns: BTreeSet<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(map_err)?
                .collect::<Result<_, _>>()
                .map_err(map_err)?;
            snapshot.insert(table, columns);
        }
        Ok(snapshot)
    }
}

fn map_err(err: rusqlite::Error) -> DbError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::ConstraintViolation => DbError::Constraint {
                message: message
                    .clone()
                    .unwrap_or_else(|| "constraint failed".into()),
            },
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                DbError::Transient(err.to_string())
            }
            _ => DbError::Sqlite(err),
        },
        _ => DbError::Sqlite(err),
    }
}

fn to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Int(i) => rusqlite::types::Value::Integer(*i),
        Value::Float(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
    }
}

fn from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Decode one TSV field: `\N` is NULL, escapes are unwound, and numeric
/// text becomes a typed value so staged keys compare correctly.
fn parse_tsv_field(raw: &str) -> Value {
    if raw == "\\N" {
        return Value::Null;
    }
    let mut text = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('t') => text.push('\t'),
                Some('n') => text.push('\n'),
                Some('\\') => text.push('\\'),
                Some(other) => {
                    text.push('\\');
                    text.push(other);
                }
                None => text.push('\\'),
            }
        } else {
            text.push(c);
        }
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        if text.chars().any(|c| matches!(c, '.' | 'e' | 'E')) {
            return Value::Float(f);
        }
    }
    Value::Text(text)
}
