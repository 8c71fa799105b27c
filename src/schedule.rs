//! Generator scheduling: footprint overlap -> dependency graph -> order.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::warn;

use crate::dep::Dep;
use crate::generator::Generator;
use crate::model::Schema;
use crate::query::QueryError;

/// Result type for planning.
pub type ScheduleResult<T> = Result<T, ScheduleError>;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("duplicate generator name '{0}'")]
    DuplicateGenerator(String),

    /// Mutually dependent generators; reported before any SQL runs.
    #[error("dependency cycle between generators: {0:?}")]
    Cycle(Vec<String>),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// A validated execution plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Generator names in execution order.
    pub order: Vec<String>,
    /// The inferred footprint of each generator.
    pub deps: BTreeMap<String, Dep>,
    /// Human-readable coverage warnings (also emitted to the log).
    pub warnings: Vec<String>,
}

/// Compute the execution order.
///
/// An edge runs from producer to consumer whenever one generator's needs
/// intersect another's yields. Self-overlap (a generator reading its own
/// output) is legal and creates no edge. Among simultaneously-ready
/// generators the lexicographically smallest name runs first, so the
/// order is deterministic for a fixed generator set.
pub fn plan(schema: &Schema, generators: &[Generator]) -> ScheduleResult<Plan> {
    let mut deps: BTreeMap<String, Dep> = BTreeMap::new();
    for gen in generators {
        if deps.contains_key(&gen.name) {
            return Err(ScheduleError::DuplicateGenerator(gen.name.clone()));
        }
        deps.insert(gen.name.clone(), gen.dep()?);
    }

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut indices: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    for name in deps.keys() {
        indices.insert(name, graph.add_node(name.clone()));
    }
    for (consumer, consumer_dep) in &deps {
        for (producer, producer_dep) in &deps {
            if producer == consumer {
                continue;
            }
            if consumer_dep.test(producer_dep) {
                graph.add_edge(indices[producer.as_str()], indices[consumer.as_str()], ());
            }
        }
    }

    // tarjan_scc returns single-node components for acyclic nodes; any
    // larger component is a genuine cycle.
    for component in tarjan_scc(&graph) {
        if component.len() > 1 {
            let mut names: Vec<String> = component
                .iter()
                .map(|ix| graph[*ix].clone())
                .collect();
            names.sort();
            return Err(ScheduleError::Cycle(names));
        }
    }

    // Kahn's algorithm with a lexicographic ready set.
    let mut in_degree: BTreeMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|ix| (ix, graph.neighbors_directed(ix, petgraph::Incoming).count()))
        .collect();
    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(ix, _)| graph[*ix].clone())
        .collect();
    let mut order = Vec::with_capacity(deps.len());

    while let Some(name) = ready.iter().next().cloned() {
        ready.remove(&name);
        let ix = indices[name.as_str()];
        order.push(name);
        for succ in graph.neighbors_directed(ix, petgraph::Outgoing) {
            let degree = in_degree
                .get_mut(&succ)
                .map(|d| {
                    *d -= 1;
                    *d
                })
                .unwrap_or(0);
            if degree == 0 {
                ready.insert(graph[succ].clone());
            }
        }
    }

    let warnings = coverage_warnings(schema, deps.values());
    for warning in &warnings {
        warn!("{}", warning);
    }

    Ok(Plan {
        order,
        deps,
        warnings,
    })
}

/// Columns and tables of the schema no generator populates. Informative
/// only: a model may deliberately leave columns to defaults.
fn coverage_warnings<'a>(
    schema: &Schema,
    deps: impl Iterator<Item = &'a Dep>,
) -> Vec<String> {
    let mut tables_yielded: BTreeSet<&str> = BTreeSet::new();
    let mut columns_yielded: BTreeSet<&str> = BTreeSet::new();
    for dep in deps {
        tables_yielded.extend(dep.tables_yielded.iter().map(|s| s.as_str()));
        columns_yielded.extend(dep.columns_yielded.iter().map(|s| s.as_str()));
    }

    let mut warnings = Vec::new();
    for entity in schema.entities() {
        if !tables_yielded.contains(entity.name()) {
            warnings.push(format!("no generator populates table '{}'", entity.name()));
        }
    }
    for column in schema.all_columns() {
        if !columns_yielded.contains(column.as_str()) {
            warnings.push(format!("no generator populates column '{}'", column));
        }
    }
    warnings
}
