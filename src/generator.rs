//! Generators: scheduled units of work.
//!
//! A generator couples an optional source query, an ordered transform
//! pipeline and a list of loads. Generators are content-addressed: the
//! hash over their declarative parts keys the dedup ledger and gives them
//! a stable identity across runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::dep::Dep;
use crate::hash::content_hash;
use crate::load::{Load, ValueSource};
use crate::query::{Query, QueryError, QueryResult};
use crate::value::Value;

/// Result type for generator construction and inspection.
pub type GeneratorResult<T> = Result<T, GeneratorError>;

/// Configuration errors in a generator definition.
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// A transform references a step that is neither the query nor an
    /// earlier transform.
    #[error("transform '{transform}' references unknown step '{step}'")]
    UnknownStep { transform: String, step: String },

    /// Transform references form a cycle.
    #[error("cyclic transform references in generator '{0}'")]
    TransformCycle(String),

    #[error("failed to hash generator content: {0}")]
    Hash(#[from] serde_json::Error),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// The result of applying a transform to one row.
///
/// Row-level control flow is a value, not an exception: `Skipped` drops
/// the row from all downstream loading without aborting the batch, and
/// `Failed` carries external-code error text.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Produced(BTreeMap<String, Value>),
    Skipped,
    Failed(String),
}

/// The resolved inputs handed to a transform closure, keyed by the
/// input's column/output name.
pub type RowView = BTreeMap<String, Value>;

/// External transform logic.
pub type TransformFn = Arc<dyn Fn(&RowView) -> TransformOutcome + Send + Sync>;

/// One step of a generator's computation graph.
#[derive(Clone)]
pub struct Transform {
    pub name: String,
    pub inputs: Vec<ValueSource>,
    pub outputs: Vec<String>,
    pub func: TransformFn,
}

impl Transform {
    pub fn new(
        name: &str,
        inputs: Vec<ValueSource>,
        outputs: Vec<&str>,
        func: impl Fn(&RowView) -> TransformOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs: outputs.into_iter().map(String::from).collect(),
            func: Arc::new(func),
        }
    }

    /// The declarative signature hashed into the generator identity and
    /// used to key transform outputs in row namespaces.
    pub fn signature(&self) -> TransformSig<'_> {
        TransformSig {
            name: &self.name,
            inputs: &self.inputs,
            outputs: &self.outputs,
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a transform, minus its closure.
#[derive(Serialize)]
pub struct TransformSig<'a> {
    pub name: &'a str,
    pub inputs: &'a [ValueSource],
    pub outputs: &'a [String],
}

/// A scheduled unit of work.
#[derive(Debug, Clone, Default)]
pub struct Generator {
    pub name: String,
    pub query: Option<Query>,
    pub transforms: Vec<Transform>,
    pub loads: Vec<Load>,
    pub tags: BTreeSet<String>,
    pub batch_size: Option<usize>,
    /// Extra footprint declared by hand, merged over the inferred one.
    pub extra_dep: Option<Dep>,
}

impl Generator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn load(mut self, load: Load) -> Self {
        self.loads.push(load);
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_extra_dep(mut self, dep: Dep) -> Self {
        self.extra_dep = Some(dep);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Content hash over the declarative parts (name, query structure,
    /// transform signatures, loads, tags). Keys the repeats ledger.
    pub fn content_hash(&self) -> GeneratorResult<String> {
        let sigs: Vec<TransformSig<'_>> =
            self.transforms.iter().map(Transform::signature).collect();
        let digest = (
            &self.name,
            &self.query,
            &sigs,
            &self.loads,
            &self.tags,
        );
        Ok(content_hash(&digest)?)
    }

    /// Transform execution order, topologically derived from argument
    /// references: a transform may only reference another transform's
    /// output if that transform precedes it, or the query itself.
    pub fn ordered_transforms(&self) -> GeneratorResult<Vec<&Transform>> {
        let mut remaining: Vec<&Transform> = self.transforms.iter().collect();
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|t| {
                t.inputs.iter().all(|input| match input {
                    ValueSource::Transform { step, .. } => done.contains(step.as_str()),
                    ValueSource::Query { .. }
                    | ValueSource::Const(_)
                    | ValueSource::ConstList(_) => true,
                })
            });
            match ready {
                Some(pos) => {
                    let transform = remaining.remove(pos);
                    done.insert(&transform.name);
                    order.push(transform);
                }
                None => {
                    // Distinguish a dangling reference from a true cycle.
                    let known: BTreeSet<&str> =
                        self.transforms.iter().map(|t| t.name.as_str()).collect();
                    for transform in &remaining {
                        for input in &transform.inputs {
                            if let ValueSource::Transform { step, .. } = input {
                                if !known.contains(step.as_str()) {
                                    return Err(GeneratorError::UnknownStep {
                                        transform: transform.name.clone(),
                                        step: step.clone(),
                                    });
                                }
                            }
                        }
                    }
                    return Err(GeneratorError::TransformCycle(self.name.clone()));
                }
            }
        }
        Ok(order)
    }

    /// Infer the generator's footprint from its query and loads, merged
    /// with any explicitly declared extra footprint.
    pub fn dep(&self) -> QueryResult<Dep> {
        let mut dep = Dep::new();
        if let Some(query) = &self.query {
            query_dep(query, &mut dep)?;
        }
        for load in &self.loads {
            load.dep(&mut dep);
        }
        if let Some(extra) = &self.extra_dep {
            dep = Dep::merge([&dep, extra]);
        }
        Ok(dep)
    }

    /// Every value source referenced by any load; the engine prunes row
    /// namespaces down to these before dispatching to the loader.
    pub fn saved_sources(&self) -> Vec<ValueSource> {
        let mut out = Vec::new();
        for load in &self.loads {
            load.sources(&mut out);
        }
        out
    }
}

/// Read footprint of a query: its basis, every entity and attribute its
/// paths touch, and the same for every nested subquery. Subqueries stay
/// out of the outer FROM but their reads still schedule.
fn query_dep(query: &Query, dep: &mut Dep) -> QueryResult<()> {
    for entity in query.resolve_basis()? {
        dep.need_table(&entity);
    }
    for path in query.paths() {
        for entity in path.entities()? {
            dep.need_table(&entity);
        }
        if let Some(attr) = path.attr_name() {
            let head = path.head()?;
            dep.need_column(&head, attr);
        }
    }
    for sub in query.subqueries() {
        query_dep(sub, dep)?;
    }
    Ok(())
}
