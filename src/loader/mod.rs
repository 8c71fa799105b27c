//! The loader: resolved columns -> staged batch -> idempotent merge.
//!
//! Loads never insert row-by-row. Each batch is broadcast to a common
//! length, staged as TSV into a transient table, and merged into the
//! target in one statement, so a re-run of the same batch converges to
//! the same warehouse state. Foreign-key rejections are recovered by
//! deleting the offending staged rows and retrying the merge.

mod broadcast;
mod stage;

pub use broadcast::broadcast;
pub use stage::StagingTable;

use std::collections::BTreeMap;

use tracing::warn;

use crate::db::{parse_fk_violation, Database};
use crate::hash::content_hash;
use crate::load::{Load, LoadError, LoadResult, RelSource, ValueSource};
use crate::model::{Schema, SOFT_DELETE_COLUMN};
use crate::value::Value;

/// Maximum merge attempts while recovering from foreign-key rejections.
const MAX_FK_RECOVERY: usize = 5;
/// Attempts for transient faults during bulk ingestion.
const MAX_TRANSIENT_RETRY: usize = 3;

/// Supplies the column of values behind each [`ValueSource`].
pub trait ValueResolver {
    fn resolve(&self, source: &ValueSource) -> LoadResult<Vec<Value>>;
}

/// A resolver over pre-materialized columns. Query columns are keyed by
/// name; transform outputs by `step.output`.
#[derive(Debug, Default)]
pub struct ColumnResolver {
    columns: BTreeMap<String, Vec<Value>>,
}

impl ColumnResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, values: Vec<Value>) {
        self.columns.insert(name.into(), values);
    }
}

impl ValueResolver for ColumnResolver {
    fn resolve(&self, source: &ValueSource) -> LoadResult<Vec<Value>> {
        let key = match source {
            ValueSource::Const(value) => return Ok(vec![value.clone()]),
            ValueSource::ConstList(values) => return Ok(values.clone()),
            ValueSource::Query { column } => column.clone(),
            ValueSource::Transform { step, output } => format!("{}.{}", step, output),
        };
        self.columns
            .get(&key)
            .cloned()
            .ok_or(LoadError::UnknownSource(key))
    }
}

/// Executes load specifications against a target database.
pub struct Loader<'a> {
    schema: &'a Schema,
}

impl<'a> Loader<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    /// Run one load. Returns the primary keys of the affected rows, in
    /// input order, so a parent load can thread them into its FK column.
    pub fn load(
        &self,
        db: &mut dyn Database,
        load: &Load,
        resolver: &dyn ValueResolver,
    ) -> LoadResult<Vec<Value>> {
        let entity = self.schema.entity(&load.entity)?;
        let pk = entity.pk_column().to_string();

        // Resolve leaves first so nested keys participate in broadcast.
        let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (name, source) in &load.attrs {
            let attr = entity.attr(name).ok_or_else(|| {
                crate::model::ModelError::UnknownAttr {
                    entity: load.entity.clone(),
                    attr: name.clone(),
                }
            })?;
            let values = resolver
                .resolve(source)?
                .into_iter()
                .map(|v| attr.attr_type.cast(v))
                .collect::<Result<Vec<_>, _>>()?;
            columns.insert(name.clone(), values);
        }
        for (name, source) in &load.rels {
            let values = match source {
                RelSource::Key(value_source) => resolver.resolve(value_source)?,
                RelSource::Nested(nested) => self.load(db, nested, resolver)?,
            };
            columns.insert(name.clone(), values);
        }
        if let Some(key_source) = &load.key {
            columns.insert(pk.clone(), resolver.resolve(key_source)?);
        }

        let (len, mut columns) = broadcast(columns)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        if !columns.contains_key(&pk) {
            columns.insert(pk.clone(), self.derive_keys(load, &columns, len)?);
        }
        let keys = columns[&pk].clone();

        let stage_columns: Vec<String> = columns.keys().cloned().collect();
        let stage = StagingTable::create(db, &load.entity, stage_columns)?;
        let tsv = stage.tsv(&columns, len);

        let result = self.stage_and_merge(db, load, &stage, &tsv, &pk);
        // Staging tables never outlive the load, even on error.
        let drop_result = stage.drop(db);
        result?;
        drop_result?;

        Ok(keys)
    }

    fn stage_and_merge(
        &self,
        db: &mut dyn Database,
        load: &Load,
        stage: &StagingTable,
        tsv: &str,
        pk: &str,
    ) -> LoadResult<()> {
        let mut attempt = 0;
        loop {
            match db.copy_in(&stage.name, &stage.columns, tsv) {
                Ok(_) => break,
                Err(err) if err.is_transient() && attempt + 1 < MAX_TRANSIENT_RETRY => {
                    attempt += 1;
                    warn!(
                        entity = %load.entity,
                        attempt,
                        "transient fault staging batch, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        let entity = self.schema.entity(&load.entity)?;
        let sql = if load.insert {
            insert_merge_sql(entity, stage, pk)
        } else {
            match update_merge_sql(entity, stage, pk) {
                Some(sql) => sql,
                // A pure locate with no writable columns merges nothing.
                None => return Ok(()),
            }
        };

        for cycle in 0.. {
            match db.execute(&sql) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_foreign_key() => {
                    if cycle + 1 >= MAX_FK_RECOVERY {
                        return Err(LoadError::FkRecoveryExhausted {
                            entity: load.entity.clone(),
                            attempts: MAX_FK_RECOVERY,
                        });
                    }
                    self.evict_fk_violations(db, load, stage, &err.to_string())?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("recovery loop returns or errors")
    }

    /// Delete staged rows whose FK values have no target row, then let
    /// the caller retry the merge. Backends that report the offending
    /// column narrow the scan; SQLite does not, so every staged relation
    /// column is checked.
    fn evict_fk_violations(
        &self,
        db: &mut dyn Database,
        load: &Load,
        stage: &StagingTable,
        message: &str,
    ) -> LoadResult<()> {
        let entity = self.schema.entity(&load.entity)?;
        let reported = parse_fk_violation(message);

        let mut evicted = 0;
        for rel in entity.rels() {
            if !stage.columns.contains(&rel.name) {
                continue;
            }
            if let Some(violation) = &reported {
                if violation.column != rel.name {
                    continue;
                }
            }
            let target = self.schema.entity(&rel.target)?;
            let removed = db.execute(&format!(
                "DELETE FROM {stage} WHERE {rel} IS NOT NULL \
                 AND {rel} NOT IN (SELECT {target_pk} FROM {target})",
                stage = stage.name,
                rel = rel.name,
                target_pk = target.pk_column(),
                target = rel.target,
            ))?;
            if removed > 0 {
                warn!(
                    entity = %load.entity,
                    relation = %rel.name,
                    rows = removed,
                    "dropped staged rows with dangling foreign keys"
                );
            }
            evicted += removed;
        }

        if evicted == 0 {
            return Err(LoadError::UnattributableViolation(load.entity.clone()));
        }
        Ok(())
    }

    /// Synthetic keys: the content hash of the entity name and the full
    /// identifying tuple. Equal identity always maps to the same key, so
    /// repeated loads converge instead of duplicating rows.
    fn derive_keys(
        &self,
        load: &Load,
        columns: &BTreeMap<String, Vec<Value>>,
        len: usize,
    ) -> LoadResult<Vec<Value>> {
        let entity = self.schema.entity(&load.entity)?;
        let mut identity_columns: Vec<&str> = entity.identifying_attrs();
        identity_columns.extend(entity.identifying_rels());
        identity_columns.sort_unstable();

        let mut keys = Vec::with_capacity(len);
        for row in 0..len {
            let tuple: Vec<(&str, &Value)> = identity_columns
                .iter()
                .map(|name| {
                    let value = columns
                        .get(*name)
                        .map(|values| &values[row])
                        .unwrap_or(&Value::Null);
                    (*name, value)
                })
                .collect();
            let hash = content_hash(&(&load.entity, &tuple))?;
            keys.push(Value::Text(hash));
        }
        Ok(keys)
    }
}

/// `INSERT ... SELECT ... ON CONFLICT(pk) DO UPDATE`: create-or-update
/// on the synthetic key. Identifying columns are never rewritten; the
/// soft-delete flag is cleared so a re-created row comes back.
fn insert_merge_sql(entity: &crate::model::Entity, stage: &StagingTable, pk: &str) -> String {
    let columns = stage.columns.join(", ");
    let mut updates: Vec<String> = vec![format!("{} = 0", SOFT_DELETE_COLUMN)];
    let identifying_attrs = entity.identifying_attrs();
    let identifying_rels = entity.identifying_rels();
    for column in &stage.columns {
        if column == pk
            || identifying_attrs.contains(&column.as_str())
            || identifying_rels.contains(&column.as_str())
        {
            continue;
        }
        updates.push(format!("{col} = excluded.{col}", col = column));
    }
    // WHERE true disambiguates the upsert clause for SQLite's parser.
    format!(
        "INSERT INTO {table} ({columns}) SELECT {columns} FROM {stage} WHERE true \
         ON CONFLICT({pk}) DO UPDATE SET {updates}",
        table = entity.name(),
        columns = columns,
        stage = stage.name,
        pk = pk,
        updates = updates.join(", "),
    )
}

/// `UPDATE ... FROM` on the primary key. Identifying columns only ever
/// locate rows (directly via the derived key), so they never appear
/// among the assignments.
fn update_merge_sql(
    entity: &crate::model::Entity,
    stage: &StagingTable,
    pk: &str,
) -> Option<String> {
    let identifying_attrs = entity.identifying_attrs();
    let identifying_rels = entity.identifying_rels();
    let assignments: Vec<String> = stage
        .columns
        .iter()
        .filter(|c| {
            c.as_str() != pk
                && !identifying_attrs.contains(&c.as_str())
                && !identifying_rels.contains(&c.as_str())
        })
        .map(|c| format!("{col} = s.{col}", col = c))
        .collect();
    if assignments.is_empty() {
        return None;
    }
    Some(format!(
        "UPDATE {table} SET {assignments} FROM {stage} AS s \
         WHERE {table}.{pk} = s.{pk}",
        table = entity.name(),
        assignments = assignments.join(", "),
        stage = stage.name,
        pk = pk,
    ))
}
