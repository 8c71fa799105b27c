//! Target-database abstraction.
//!
//! The engine and loader speak to the warehouse through [`Database`], a
//! small synchronous surface: statements, queries, bulk TSV ingestion and
//! a schema snapshot for additive migration. [`SqliteDb`] is the bundled
//! backend; [`MetaStore`] is the separate bookkeeping database.

mod meta;
mod sqlite;

pub use meta::{GeneratorRecord, MetaStore, RunRecord, META_VERSION};
pub use sqlite::SqliteDb;

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::value::Value;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A constraint rejection, with whatever text the backend supplied.
    #[error("constraint violation: {message}")]
    Constraint { message: String },

    /// A retriable fault (lock contention, connection hiccup).
    #[error("transient database fault: {0}")]
    Transient(String),

    #[error("unexpected result shape: {0}")]
    Shape(String),

    #[error("failed to determine data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// True when the error is a foreign-key rejection the loader may be
    /// able to recover from by dropping the offending rows.
    pub fn is_foreign_key(&self) -> bool {
        match self {
            DbError::Constraint { message } => {
                message.to_ascii_lowercase().contains("foreign key")
            }
            _ => false,
        }
    }

    /// True when a bounded retry of the same statement is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }
}

/// A rectangular query result. Row values line up with `columns`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Index of a named column.
    pub fn column_index(&self, name: &str) -> DbResult<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| DbError::Shape(format!("missing column '{}'", name)))
    }

    /// One column as an owned vector.
    pub fn column_values(&self, name: &str) -> DbResult<Vec<Value>> {
        let ix = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row[ix].clone()).collect())
    }
}

/// The synchronous surface the engine and loader require of a warehouse.
pub trait Database {
    /// Run one statement; returns the affected row count.
    fn execute(&mut self, sql: &str) -> DbResult<usize>;

    /// Run a SELECT and materialize the full result.
    fn query(&mut self, sql: &str) -> DbResult<Batch>;

    /// Bulk-ingest TSV text (`\N` for NULL, `\t`/`\n`/`\\` escaped) into
    /// the named table. Returns the row count.
    fn copy_in(&mut self, table: &str, columns: &[String], tsv: &str) -> DbResult<usize>;

    /// Tables currently present, each with its column set. Drives
    /// additive migration.
    fn schema_snapshot(&mut self) -> DbResult<BTreeMap<String, BTreeSet<String>>>;

    /// Row count of a SELECT, without materializing it.
    fn count(&mut self, sql: &str) -> DbResult<u64> {
        let batch = self.query(&format!("SELECT COUNT(*) FROM ({}) AS _sub", sql))?;
        match batch.rows.first().and_then(|row| row.first()) {
            Some(Value::Int(n)) => Ok(*n as u64),
            other => Err(DbError::Shape(format!(
                "COUNT(*) returned {:?}",
                other
            ))),
        }
    }

    /// One stable page of a SELECT. Ordering by the first output column
    /// (the first basis key) keeps pagination consistent across calls.
    fn fetch_page(&mut self, sql: &str, limit: usize, offset: usize) -> DbResult<Batch> {
        self.query(&format!(
            "SELECT * FROM ({}) AS _page ORDER BY 1 LIMIT {} OFFSET {}",
            sql, limit, offset
        ))
    }
}

/// A parsed foreign-key rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct FkViolation {
    pub column: String,
    pub value: String,
    pub table: String,
}

static FK_DETAIL: Lazy<Regex> = Lazy::new(|| {
    // Postgres-style detail line:
    //   Key (owner)=(person:1a2b) is not present in table "person".
    Regex::new(r#"Key \((?P<col>[^)]+)\)=\((?P<val>[^)]*)\) is not present in table "(?P<table>[^"]+)""#)
        .unwrap()
});

/// Extract the offending column/value/table from a foreign-key error
/// message, when the backend reports them. SQLite does not, so callers
/// must fall back to diagnosing staged rows directly.
pub fn parse_fk_violation(message: &str) -> Option<FkViolation> {
    FK_DETAIL.captures(message).map(|caps| FkViolation {
        column: caps["col"].to_string(),
        value: caps["val"].to_string(),
        table: caps["table"].to_string(),
    })
}
