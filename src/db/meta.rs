//! SQLite-based run bookkeeping.
//!
//! Kept apart from the target warehouse so that generated data and
//! pipeline state never share a database. Stored in `~/.weir/meta.db`.
//!
//! Holds, per run: the filter set, per-generator outcomes, and the
//! repeats ledger of row hashes each generator has already processed.
//! The store is versioned and auto-clears on a version mismatch, same as
//! any cache whose format may evolve.

use std::collections::HashSet;
use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{DbError, DbResult};

/// Current bookkeeping schema version. Bump when the layout changes.
pub const META_VERSION: i32 = 2;

/// One row of the run table.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub filters: String,
    pub status: String,
    /// Total generator failures, persisted when the run finishes.
    pub error_count: u64,
}

/// Per-generator outcome within a run.
#[derive(Debug, Clone)]
pub struct GeneratorRecord {
    pub name: String,
    pub gen_hash: String,
    pub status: String,
    pub rows_in: u64,
    pub rows_loaded: u64,
    pub message: Option<String>,
}

/// The bookkeeping database.
pub struct MetaStore {
    conn: Connection,
}

impl MetaStore {
    /// Open or create the store at its default location.
    pub fn open() -> DbResult<Self> {
        let path = Self::meta_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn meta_path() -> DbResult<PathBuf> {
        let base = dirs::home_dir().ok_or(DbError::NoDataDir)?;
        Ok(base.join(".weir").join("meta.db"))
    }

    fn init(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run (
                id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                filters TEXT NOT NULL,
                status TEXT NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS generator (
                run_id TEXT NOT NULL,
                name TEXT NOT NULL,
                gen_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                rows_in INTEGER NOT NULL,
                rows_loaded INTEGER NOT NULL,
                message TEXT,
                PRIMARY KEY (run_id, name)
            );

            CREATE TABLE IF NOT EXISTS repeats (
                gen_hash TEXT NOT NULL,
                row_hash TEXT NOT NULL,
                PRIMARY KEY (gen_hash, row_hash)
            );

            CREATE TABLE IF NOT EXISTS schema_snapshot (
                run_id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == META_VERSION => {}
            Some(_) => {
                self.clear_all()?;
                self.set_version()?;
            }
            None => {
                self.set_version()?;
            }
        }
        Ok(())
    }

    fn set_version(&self) -> DbResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
            params![META_VERSION.to_string()],
        )?;
        Ok(())
    }

    fn clear_all(&self) -> DbResult<()> {
        self.conn.execute_batch(
            "DELETE FROM run;
             DELETE FROM generator;
             DELETE FROM repeats;
             DELETE FROM schema_snapshot;",
        )?;
        Ok(())
    }

    /// Start a run. The filter set is recorded as JSON for later audit.
    pub fn begin_run<T: Serialize>(&self, filters: &T) -> DbResult<RunRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let started_at = now();
        let filters_json = serde_json::to_string(filters)?;
        self.conn.execute(
            "INSERT INTO run (id, started_at, filters, status) VALUES (?, ?, ?, 'running')",
            params![id, started_at, filters_json],
        )?;
        Ok(RunRecord {
            id,
            started_at,
            finished_at: None,
            filters: filters_json,
            status: "running".into(),
            error_count: 0,
        })
    }

    pub fn finish_run(&self, run_id: &str, status: &str, error_count: u64) -> DbResult<()> {
        self.conn.execute(
            "UPDATE run SET finished_at = ?, status = ?, error_count = ? WHERE id = ?",
            params![now(), status, error_count as i64, run_id],
        )?;
        Ok(())
    }

    pub fn record_generator(&self, run_id: &str, record: &GeneratorRecord) -> DbResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO generator
             (run_id, name, gen_hash, status, rows_in, rows_loaded, message)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                run_id,
                record.name,
                record.gen_hash,
                record.status,
                record.rows_in as i64,
                record.rows_loaded as i64,
                record.message,
            ],
        )?;
        Ok(())
    }

    /// Row hashes the generator has already processed, across all runs.
    pub fn repeats_for(&self, gen_hash: &str) -> DbResult<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT row_hash FROM repeats WHERE gen_hash = ?")?;
        let hashes = stmt
            .query_map(params![gen_hash], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(hashes)
    }

    /// Append newly processed row hashes in one transaction.
    pub fn append_repeats(&mut self, gen_hash: &str, row_hashes: &[String]) -> DbResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO repeats (gen_hash, row_hash) VALUES (?, ?)",
            )?;
            for row_hash in row_hashes {
                stmt.execute(params![gen_hash, row_hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop a generator's ledger, forcing full reprocessing next run.
    pub fn clear_repeats(&self, gen_hash: &str) -> DbResult<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM repeats WHERE gen_hash = ?", params![gen_hash])?;
        Ok(rows)
    }

    /// Record the schema the run executed against.
    pub fn snapshot_schema<T: Serialize>(&self, run_id: &str, schema: &T) -> DbResult<()> {
        let json = serde_json::to_string(schema)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO schema_snapshot (run_id, snapshot) VALUES (?, ?)",
            params![run_id, json],
        )?;
        Ok(())
    }

    pub fn run(&self, run_id: &str) -> DbResult<Option<RunRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, filters, status, error_count \
                 FROM run WHERE id = ?",
                params![run_id],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        filters: row.get(3)?,
                        status: row.get(4)?,
                        error_count: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
