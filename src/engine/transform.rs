//! Transform pipeline execution over one in-memory batch.

use std::collections::BTreeMap;

use super::pool::WorkerPool;
use super::{EngineError, EngineResult};
use crate::db::Batch;
use crate::generator::{Generator, RowView, TransformOutcome};
use crate::hash::content_hash;
use crate::load::ValueSource;
use crate::value::Value;

/// One batch after the transform pipeline has run.
///
/// Columns hold query outputs under their own names and transform
/// outputs under `step.output`. Rows a transform skipped are gone from
/// every column; `row_hashes` stays aligned with the surviving rows.
#[derive(Debug, Default)]
pub struct PipelineBatch {
    pub len: usize,
    pub columns: BTreeMap<String, Vec<Value>>,
    pub row_hashes: Vec<String>,
}

/// Content hash of each row of a query batch. Identity is positional
/// over the batch's column list, which the compiler emits in a fixed
/// order, so the same logical row always hashes the same.
pub fn row_hashes(batch: &Batch) -> EngineResult<Vec<String>> {
    batch
        .rows
        .iter()
        .map(|row| content_hash(&(&batch.columns, row)).map_err(EngineError::from))
        .collect()
}

/// Run a generator's transforms over one batch.
///
/// A `Failed` outcome aborts the whole generator via
/// [`EngineError::TransformFailed`]; a `Skipped` outcome silently drops
/// that row from all downstream loads.
pub fn run_pipeline(
    generator: &Generator,
    batch: &Batch,
    hashes: Vec<String>,
    pool: &WorkerPool,
) -> EngineResult<PipelineBatch> {
    let mut out = PipelineBatch {
        len: batch.len(),
        columns: BTreeMap::new(),
        row_hashes: hashes,
    };
    for (ix, column) in batch.columns.iter().enumerate() {
        out.columns.insert(
            column.clone(),
            batch.rows.iter().map(|row| row[ix].clone()).collect(),
        );
    }

    for transform in generator.ordered_transforms()? {
        let views: Vec<RowView> = (0..out.len)
            .map(|row| build_view(&transform.inputs, &out.columns, row))
            .collect::<EngineResult<_>>()?;
        let outcomes = pool.map(&views, |view| (transform.func)(view));

        for outcome in &outcomes {
            if let TransformOutcome::Failed(message) = outcome {
                return Err(EngineError::TransformFailed {
                    generator: generator.name.clone(),
                    transform: transform.name.clone(),
                    message: message.clone(),
                });
            }
        }

        let keep: Vec<bool> = outcomes
            .iter()
            .map(|o| matches!(o, TransformOutcome::Produced(_)))
            .collect();
        let kept = keep.iter().filter(|k| **k).count();

        if kept != out.len {
            for values in out.columns.values_mut() {
                let mut row = 0;
                values.retain(|_| {
                    let keep_row = keep[row];
                    row += 1;
                    keep_row
                });
            }
            let mut row = 0;
            out.row_hashes.retain(|_| {
                let keep_row = keep[row];
                row += 1;
                keep_row
            });
        }

        for output in &transform.outputs {
            let values: Vec<Value> = outcomes
                .iter()
                .filter_map(|outcome| match outcome {
                    TransformOutcome::Produced(map) => {
                        Some(map.get(output).cloned().unwrap_or(Value::Null))
                    }
                    _ => None,
                })
                .collect();
            out.columns
                .insert(format!("{}.{}", transform.name, output), values);
        }
        out.len = kept;
    }

    Ok(out)
}

/// Inputs for one row, keyed by column name (query sources), output name
/// (transform sources), or `const_{n}` for inline constants.
fn build_view(
    inputs: &[ValueSource],
    columns: &BTreeMap<String, Vec<Value>>,
    row: usize,
) -> EngineResult<RowView> {
    let mut view = RowView::new();
    for (ix, input) in inputs.iter().enumerate() {
        match input {
            ValueSource::Const(value) => {
                view.insert(format!("const_{}", ix), value.clone());
            }
            ValueSource::ConstList(values) => {
                let value = values.get(row).cloned().unwrap_or(Value::Null);
                view.insert(format!("const_{}", ix), value);
            }
            ValueSource::Query { column } => {
                let values = columns
                    .get(column)
                    .ok_or_else(|| EngineError::UnknownColumn(column.clone()))?;
                view.insert(column.clone(), values[row].clone());
            }
            ValueSource::Transform { step, output } => {
                let key = format!("{}.{}", step, output);
                let values = columns
                    .get(&key)
                    .ok_or_else(|| EngineError::UnknownColumn(key))?;
                view.insert(output.clone(), values[row].clone());
            }
        }
    }
    Ok(view)
}
