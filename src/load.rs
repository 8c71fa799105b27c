//! Load specifications: recursive insert/update declarations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dep::Dep;
use crate::model::{ModelError, Schema};
use crate::value::Value;

/// Result type for load validation and execution.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors raised by load validation (statically, at model-attach time)
/// and by the loader at execution time.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A Load may supply either a direct primary key or identifying
    /// data, never both.
    #[error("load into '{0}' supplies both a primary key and identifying data")]
    KeyAndIdentity(String),

    /// An update must locate its row: primary key or identifying data.
    #[error("update load into '{0}' supplies neither a primary key nor identifying data")]
    UpdateWithoutIdentity(String),

    /// Updates must never mutate identity.
    #[error("update load into '{entity}' writes identifying column '{column}'")]
    UpdateMutatesIdentity { entity: String, column: String },

    /// An insert must supply every identifying attribute and relation.
    #[error("insert load into '{entity}' is missing identifying column '{column}'")]
    MissingIdentity { entity: String, column: String },

    /// A nested load must target the relation's target entity.
    #[error("nested load under relation '{rel}' targets '{found}', expected '{expected}'")]
    NestedTargetMismatch {
        rel: String,
        expected: String,
        found: String,
    },

    /// Broadcast with two differently-sized non-singleton lists.
    #[error("cannot broadcast lists of lengths {0} and {1}")]
    BroadcastMismatch(usize, usize),

    /// A value source no resolver can satisfy.
    #[error("no resolved values for source '{0}'")]
    UnknownSource(String),

    /// FK-violation recovery exceeded its retry bound.
    #[error("foreign-key recovery exhausted after {attempts} attempts loading '{entity}'")]
    FkRecoveryExhausted { entity: String, attempts: usize },

    /// Recovery could not identify any offending staged row.
    #[error("foreign-key violation loading '{0}' could not be attributed to staged rows")]
    UnattributableViolation(String),

    #[error(transparent)]
    Db(#[from] crate::db::DbError),

    #[error("failed to hash load content: {0}")]
    Hash(#[from] serde_json::Error),
}

/// Where a loaded value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueSource {
    /// A column of the generator's query output.
    Query { column: String },
    /// A named output of a transform step.
    Transform { step: String, output: String },
    /// A scalar constant, broadcast across the batch.
    Const(Value),
    /// A constant column of values, aligned with the batch by broadcast.
    ConstList(Vec<Value>),
}

/// A relation column's source: either a direct key value, or a nested
/// insert Load whose resulting keys are threaded into the FK column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelSource {
    Key(ValueSource),
    Nested(Load),
}

/// A recursive insert/update specification for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub entity: String,
    /// True: create rows (idempotent upsert on the synthetic key).
    /// False: update rows located by primary key / identifying data.
    pub insert: bool,
    /// Direct primary-key reference (from a prior query).
    pub key: Option<ValueSource>,
    pub attrs: BTreeMap<String, ValueSource>,
    pub rels: BTreeMap<String, RelSource>,
}

impl Load {
    pub fn insert(entity: &str) -> Self {
        Self {
            entity: entity.into(),
            insert: true,
            key: None,
            attrs: BTreeMap::new(),
            rels: BTreeMap::new(),
        }
    }

    pub fn update(entity: &str) -> Self {
        Self {
            entity: entity.into(),
            insert: false,
            key: None,
            attrs: BTreeMap::new(),
            rels: BTreeMap::new(),
        }
    }

    pub fn set(mut self, attr: &str, source: ValueSource) -> Self {
        self.attrs.insert(attr.into(), source);
        self
    }

    pub fn rel(mut self, rel: &str, source: RelSource) -> Self {
        self.rels.insert(rel.into(), source);
        self
    }

    pub fn with_key(mut self, source: ValueSource) -> Self {
        self.key = Some(source);
        self
    }

    /// Static validation against the schema, applied when the Load is
    /// attached to the model rather than at execution time.
    pub fn validate(&self, schema: &Schema) -> LoadResult<()> {
        let entity = schema.entity(&self.entity)?;

        for attr in self.attrs.keys() {
            if entity.attr(attr).is_none() {
                return Err(ModelError::UnknownAttr {
                    entity: self.entity.clone(),
                    attr: attr.clone(),
                }
                .into());
            }
        }
        for rel_name in self.rels.keys() {
            if entity.rel(rel_name).is_none() {
                return Err(ModelError::UnknownRelation(rel_name.clone()).into());
            }
        }

        let identifying_attrs = entity.identifying_attrs();
        let identifying_rels = entity.identifying_rels();
        let supplies_identity = self
            .attrs
            .keys()
            .any(|a| identifying_attrs.contains(&a.as_str()))
            || self
                .rels
                .keys()
                .any(|r| identifying_rels.contains(&r.as_str()));

        if self.insert {
            if self.key.is_some() && supplies_identity {
                return Err(LoadError::KeyAndIdentity(self.entity.clone()));
            }
            // Inserts without an explicit key must carry the full natural
            // key, or the synthetic key cannot be derived.
            if self.key.is_none() {
                for attr in &identifying_attrs {
                    if !self.attrs.contains_key(*attr) {
                        return Err(LoadError::MissingIdentity {
                            entity: self.entity.clone(),
                            column: (*attr).into(),
                        });
                    }
                }
                for rel in &identifying_rels {
                    if !self.rels.contains_key(*rel) {
                        return Err(LoadError::MissingIdentity {
                            entity: self.entity.clone(),
                            column: (*rel).into(),
                        });
                    }
                }
            }
        } else if self.key.is_some() {
            // A keyed update writes every supplied column, and identity
            // never changes under update.
            for attr in self.attrs.keys() {
                if identifying_attrs.contains(&attr.as_str()) {
                    return Err(LoadError::UpdateMutatesIdentity {
                        entity: self.entity.clone(),
                        column: attr.clone(),
                    });
                }
            }
            for rel in self.rels.keys() {
                if identifying_rels.contains(&rel.as_str()) {
                    return Err(LoadError::UpdateMutatesIdentity {
                        entity: self.entity.clone(),
                        column: rel.clone(),
                    });
                }
            }
        } else {
            // Identifying data locates the rows instead of being written.
            // The full tuple is required so the synthetic key derives to
            // the same value the insert produced.
            if !supplies_identity {
                return Err(LoadError::UpdateWithoutIdentity(self.entity.clone()));
            }
            for attr in &identifying_attrs {
                if !self.attrs.contains_key(*attr) {
                    return Err(LoadError::MissingIdentity {
                        entity: self.entity.clone(),
                        column: (*attr).into(),
                    });
                }
            }
            for rel in &identifying_rels {
                if !self.rels.contains_key(*rel) {
                    return Err(LoadError::MissingIdentity {
                        entity: self.entity.clone(),
                        column: (*rel).into(),
                    });
                }
            }
        }

        for (rel_name, source) in &self.rels {
            if let RelSource::Nested(nested) = source {
                let rel = entity
                    .rel(rel_name)
                    .ok_or_else(|| ModelError::UnknownRelation(rel_name.clone()))?;
                if nested.entity != rel.target {
                    return Err(LoadError::NestedTargetMismatch {
                        rel: rel_name.clone(),
                        expected: rel.target.clone(),
                        found: nested.entity.clone(),
                    });
                }
                nested.validate(schema)?;
            }
        }

        Ok(())
    }

    /// Contribute this load's footprint: an insert yields the table and
    /// every populated column; an update yields only columns, plus a read
    /// footprint for the parent tables it touches through relations.
    pub fn dep(&self, dep: &mut Dep) {
        if self.insert {
            dep.yield_table(&self.entity);
        }
        for attr in self.attrs.keys() {
            dep.yield_column(&self.entity, attr);
        }
        for (rel_name, source) in &self.rels {
            dep.yield_column(&self.entity, rel_name);
            if let RelSource::Nested(nested) = source {
                nested.dep(dep);
            }
        }
        if !self.insert {
            dep.need_table(&self.entity);
        }
    }

    /// Every value source the load (recursively) references; used by the
    /// engine to prune row namespaces before loading.
    pub fn sources(&self, out: &mut Vec<ValueSource>) {
        if let Some(key) = &self.key {
            out.push(key.clone());
        }
        for source in self.attrs.values() {
            out.push(source.clone());
        }
        for source in self.rels.values() {
            match source {
                RelSource::Key(s) => out.push(s.clone()),
                RelSource::Nested(nested) => nested.sources(out),
            }
        }
    }
}
