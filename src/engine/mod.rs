//! The execution engine.
//!
//! Drives a full run: validate the model and generators, plan an order,
//! prepare the warehouse schema, then execute each generator — query,
//! dedup against the repeats ledger, transform pipeline, loads — while
//! recording outcomes in the bookkeeping store. A failing transform
//! fails its generator and the run moves on; infrastructure errors
//! abort the run after persisting what already happened.

mod pool;
mod transform;

pub use pool::WorkerPool;
pub use transform::{row_hashes, run_pipeline, PipelineBatch};

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{EmptyGeneratorPolicy, RunOptions, IO_TAG, PARALLEL_TAG};
use crate::db::{Batch, Database, DbError, GeneratorRecord, MetaStore};
use crate::generator::{Generator, GeneratorError};
use crate::load::{LoadError, ValueSource};
use crate::loader::{ColumnResolver, Loader};
use crate::model::{ModelError, Schema};
use crate::query::QueryError;
use crate::schedule::{plan, ScheduleError};

/// Batch size when neither the run options, the generator, nor a row
/// count suggest one.
const DEFAULT_BATCH_ROWS: usize = 1024;
/// A counted result set is split into roughly this many batches.
const TARGET_BATCHES: u64 = 20;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Db(#[from] DbError),

    /// A run filter names a generator that does not exist.
    #[error("unknown generator '{0}' in run filters")]
    UnknownGenerator(String),

    /// A generator's query matched nothing and the policy rejects that.
    #[error("generator '{0}' produced no rows")]
    EmptyGenerator(String),

    /// A generator declares no loads, is not `io`-tagged, and the policy
    /// rejects doing no persistent work.
    #[error("generator '{0}' declares no loads")]
    LoadlessGenerator(String),

    /// External transform code reported a row failure.
    #[error("transform '{transform}' in generator '{generator}' failed: {message}")]
    TransformFailed {
        generator: String,
        transform: String,
        message: String,
    },

    #[error("unknown pipeline column '{0}'")]
    UnknownColumn(String),

    #[error("failed to hash row content: {0}")]
    Hash(#[from] serde_json::Error),
}

impl EngineError {
    /// Failures scoped to one generator; the run continues past them.
    fn is_generator_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::TransformFailed { .. }
                | EngineError::EmptyGenerator(_)
                | EngineError::LoadlessGenerator(_)
        )
    }
}

/// Outcome of one generator within a run.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorStatus {
    Completed { rows_in: u64, rows_loaded: u64 },
    Failed { message: String },
    /// Excluded by name/tag/position filters.
    Filtered,
}

/// What a run did, per generator, plus the planner's coverage warnings.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub statuses: BTreeMap<String, GeneratorStatus>,
    pub warnings: Vec<String>,
    /// How many generators failed; also persisted on the run record.
    pub error_count: u64,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.statuses
            .values()
            .any(|s| matches!(s, GeneratorStatus::Failed { .. }))
    }
}

/// A configured pipeline, ready to run.
pub struct Engine {
    schema: Schema,
    generators: Vec<Generator>,
    options: RunOptions,
}

impl Engine {
    pub fn new(schema: Schema, generators: Vec<Generator>, options: RunOptions) -> Self {
        Self {
            schema,
            generators,
            options,
        }
    }

    /// Execute a full run against the target warehouse.
    pub fn run(
        &self,
        target: &mut dyn Database,
        meta: &mut MetaStore,
    ) -> EngineResult<RunReport> {
        self.validate()?;
        let plan = plan(&self.schema, &self.generators)?;

        self.prepare_schema(target)?;

        let run = meta.begin_run(&self.options)?;
        let entities: Vec<_> = self.schema.entities().collect();
        meta.snapshot_schema(&run.id, &entities)?;
        info!(run_id = %run.id, generators = plan.order.len(), "run started");

        let pool = match (self.options.force_serial, self.options.workers) {
            (true, _) => WorkerPool::serial(),
            (false, Some(n)) => WorkerPool::new(n),
            (false, None) => WorkerPool::from_cpus(),
        };

        let by_name: BTreeMap<&str, &Generator> = self
            .generators
            .iter()
            .map(|g| (g.name.as_str(), g))
            .collect();
        let active = self.positional_window(&plan.order);

        let mut statuses: BTreeMap<String, GeneratorStatus> = BTreeMap::new();
        for (position, name) in plan.order.iter().enumerate() {
            let generator = by_name[name.as_str()];
            if !active.contains(&position)
                || !self.options.selects(name, &generator.tags)
            {
                statuses.insert(name.clone(), GeneratorStatus::Filtered);
                continue;
            }

            match self.run_generator(generator, target, meta, &pool) {
                Ok((rows_in, rows_loaded)) => {
                    let hash = generator.content_hash()?;
                    meta.record_generator(
                        &run.id,
                        &GeneratorRecord {
                            name: name.clone(),
                            gen_hash: hash,
                            status: "completed".into(),
                            rows_in,
                            rows_loaded,
                            message: None,
                        },
                    )?;
                    info!(generator = %name, rows_in, rows_loaded, "generator completed");
                    statuses.insert(
                        name.clone(),
                        GeneratorStatus::Completed {
                            rows_in,
                            rows_loaded,
                        },
                    );
                }
                Err(err) if err.is_generator_scoped() => {
                    let message = err.to_string();
                    warn!(generator = %name, error = %message, "generator failed");
                    let hash = generator.content_hash()?;
                    meta.record_generator(
                        &run.id,
                        &GeneratorRecord {
                            name: name.clone(),
                            gen_hash: hash,
                            status: "failed".into(),
                            rows_in: 0,
                            rows_loaded: 0,
                            message: Some(message.clone()),
                        },
                    )?;
                    statuses.insert(name.clone(), GeneratorStatus::Failed { message });
                }
                Err(err) => {
                    // Count the aborting failure alongside the recorded ones.
                    meta.finish_run(&run.id, "aborted", failure_count(&statuses) + 1)?;
                    return Err(err);
                }
            }
        }

        let error_count = failure_count(&statuses);
        let run_status = if error_count > 0 { "failed" } else { "completed" };
        meta.finish_run(&run.id, run_status, error_count)?;

        Ok(RunReport {
            run_id: run.id,
            statuses,
            warnings: plan.warnings,
            error_count,
        })
    }

    /// Configuration errors are all surfaced here, before any SQL runs.
    fn validate(&self) -> EngineResult<()> {
        for generator in &self.generators {
            generator.ordered_transforms()?;
            for load in &generator.loads {
                load.validate(&self.schema)?;
            }
        }
        let known: BTreeSet<&str> = self
            .generators
            .iter()
            .map(|g| g.name.as_str())
            .collect();
        for name in self.options.named_generators() {
            if !known.contains(name) {
                return Err(EngineError::UnknownGenerator(name.into()));
            }
        }
        Ok(())
    }

    fn prepare_schema(&self, target: &mut dyn Database) -> EngineResult<()> {
        let statements = if self.options.reset_schema {
            let mut out = self.schema.drop_ddl();
            out.extend(self.schema.ddl());
            out
        } else {
            self.schema.migrate_ddl(&target.schema_snapshot()?)
        };
        for statement in statements {
            debug!(sql = %statement, "schema DDL");
            target.execute(&statement)?;
        }
        Ok(())
    }

    /// Positions in the schedule selected by start_at/stop_before.
    fn positional_window(&self, order: &[String]) -> std::ops::Range<usize> {
        let start = self
            .options
            .start_at
            .as_ref()
            .and_then(|name| order.iter().position(|n| n == name))
            .unwrap_or(0);
        let end = self
            .options
            .stop_before
            .as_ref()
            .and_then(|name| order.iter().position(|n| n == name))
            .unwrap_or(order.len());
        start..end
    }

    fn run_generator(
        &self,
        generator: &Generator,
        target: &mut dyn Database,
        meta: &mut MetaStore,
        pool: &WorkerPool,
    ) -> EngineResult<(u64, u64)> {
        let gen_hash = generator.content_hash()?;
        let loader = Loader::new(&self.schema);

        // A generator without loads does no persistent work; only the
        // side effects of an io-tagged one count as work.
        if generator.loads.is_empty()
            && !generator.has_tag(IO_TAG)
            && self.options.empty_generators == EmptyGeneratorPolicy::Reject
        {
            return Err(EngineError::LoadlessGenerator(generator.name.clone()));
        }
        // Only generators that opted in fan out; the pool handle is
        // Copy, so this is just a narrowing.
        let pool = if generator.has_tag(PARALLEL_TAG) {
            *pool
        } else {
            WorkerPool::serial()
        };
        let pool = &pool;

        let source = self.fetch_source(generator, target)?;
        if source.is_empty() && generator.query.is_some() {
            match self.options.empty_generators {
                EmptyGeneratorPolicy::Reject => {
                    return Err(EngineError::EmptyGenerator(generator.name.clone()))
                }
                EmptyGeneratorPolicy::Allow => return Ok((0, 0)),
            }
        }

        let mut hashes = row_hashes(&source)?;
        let mut rows = source.rows;
        let columns = source.columns;

        // Dedup against the ledger, unless retrying or the generator
        // talks to an external system every run.
        if !self.options.retry && !generator.has_tag(IO_TAG) {
            let seen = meta.repeats_for(&gen_hash)?;
            if !seen.is_empty() {
                let mut kept_rows = Vec::with_capacity(rows.len());
                let mut kept_hashes = Vec::with_capacity(hashes.len());
                for (row, hash) in rows.into_iter().zip(hashes.into_iter()) {
                    if !seen.contains(&hash) {
                        kept_rows.push(row);
                        kept_hashes.push(hash);
                    }
                }
                rows = kept_rows;
                hashes = kept_hashes;
            }
        }
        let rows_in = rows.len() as u64;

        let saved: BTreeSet<String> = generator
            .saved_sources()
            .iter()
            .filter_map(|source| match source {
                ValueSource::Query { column } => Some(column.clone()),
                ValueSource::Transform { step, output } => {
                    Some(format!("{}.{}", step, output))
                }
                ValueSource::Const(_) | ValueSource::ConstList(_) => None,
            })
            .collect();

        let batch_size = self.batch_size(generator, rows.len());
        let mut rows_loaded = 0u64;

        let mut start = 0;
        while start < rows.len() {
            let end = (start + batch_size).min(rows.len());
            let chunk = Batch {
                columns: columns.clone(),
                rows: rows[start..end].to_vec(),
            };
            let chunk_hashes = hashes[start..end].to_vec();

            let pipeline = run_pipeline(generator, &chunk, chunk_hashes, pool)?;

            // Only columns some load actually references reach the
            // resolver; the rest of the row namespace is dropped here.
            let mut resolver = ColumnResolver::new();
            for (name, values) in pipeline.columns {
                if saved.contains(&name) {
                    resolver.insert(&name, values);
                }
            }
            for load in &generator.loads {
                let keys = loader.load(target, load, &resolver)?;
                rows_loaded += keys.len() as u64;
            }
            // Ledgered batch by batch, so an abort mid-generator keeps
            // the dedup progress of everything already loaded.
            meta.append_repeats(&gen_hash, &pipeline.row_hashes)?;
            start = end;
        }

        Ok((rows_in, rows_loaded))
    }

    /// Materialize a generator's source rows. Paging goes through a
    /// stable ORDER BY so a large result arrives in consistent pieces;
    /// materializing before any load runs keeps self-reading generators
    /// from seeing their own writes mid-query.
    fn fetch_source(
        &self,
        generator: &Generator,
        target: &mut dyn Database,
    ) -> EngineResult<Batch> {
        let query = match &generator.query {
            Some(query) => query,
            // Query-less generators run their pipeline once over a
            // single empty row; constants broadcast from there.
            None => {
                return Ok(Batch {
                    columns: Vec::new(),
                    rows: vec![Vec::new()],
                })
            }
        };
        let compiled = query.compile(&self.schema)?;
        debug!(generator = %generator.name, sql = %compiled.sql, "compiled query");

        let page_size = if self.options.skip_count {
            DEFAULT_BATCH_ROWS
        } else {
            let total = target.count(&compiled.sql)?;
            sized_batches(total)
        };

        let mut columns = Vec::new();
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = target.fetch_page(&compiled.sql, page_size, offset)?;
            if columns.is_empty() {
                columns = page.columns;
            }
            let fetched = page.rows.len();
            rows.extend(page.rows);
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        Ok(Batch { columns, rows })
    }

    /// First match wins: run override, generator default, single-row
    /// batches when counting was skipped, else sized from the row count.
    fn batch_size(&self, generator: &Generator, total_rows: usize) -> usize {
        self.options.batch_size.or(generator.batch_size).unwrap_or_else(|| {
            if self.options.skip_count {
                1
            } else {
                sized_batches(total_rows as u64)
            }
        })
    }
}

fn failure_count(statuses: &BTreeMap<String, GeneratorStatus>) -> u64 {
    statuses
        .values()
        .filter(|s| matches!(s, GeneratorStatus::Failed { .. }))
        .count() as u64
}

/// Split `total` rows into roughly [`TARGET_BATCHES`] batches.
fn sized_batches(total: u64) -> usize {
    let size = total.div_ceil(TARGET_BATCHES).max(1);
    (size as usize).min(DEFAULT_BATCH_ROWS * 64).max(1)
}
