//! Join nodes with structural-hash aliasing.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::hash::short_hash;
use crate::model::{ModelResult, Schema};

use super::AlgebraResult;

/// Key addressing a join in the arena. Equal to the join's alias, which
/// is itself a function of the join's structure, so index-based equality
/// and structural equality coincide.
pub type JoinKey = String;

/// One join condition: a set of relations tying this join to another,
/// already-hashed join. Edges only point at existing arena entries, so
/// cycles cannot occur by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Condition {
    pub other: JoinKey,
    pub rels: BTreeSet<String>,
}

impl Condition {
    pub fn single(other: JoinKey, rel: &str) -> Self {
        let mut rels = BTreeSet::new();
        rels.insert(rel.to_string());
        Self { other, rels }
    }
}

/// One aliased occurrence of an entity in a FROM clause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Join {
    pub entity: String,
    pub alias: JoinKey,
    pub conditions: Vec<Condition>,
}

impl Join {
    /// A basis join: no incoming conditions, aliased as the bare entity
    /// name. Renders as a plain table reference.
    pub fn basis(entity: &str) -> Self {
        Self {
            entity: entity.into(),
            alias: entity.into(),
            conditions: vec![],
        }
    }

    /// A joined occurrence. The alias is `{entity}_{hash}` where the hash
    /// covers the structural description: the condition list (relation
    /// names plus the aliases of the joins they reference) and the entity
    /// name. Structurally identical joins therefore collapse to one alias.
    pub fn joined(entity: &str, conditions: Vec<Condition>) -> AlgebraResult<Self> {
        let description: Vec<String> = conditions
            .iter()
            .map(|c| {
                let rels: Vec<&str> = c.rels.iter().map(|r| r.as_str()).collect();
                format!("{}@{}", rels.join("+"), c.other)
            })
            .collect();
        let hash = short_hash(&(entity, &description))?;
        Ok(Self {
            entity: entity.into(),
            alias: format!("{}_{}", entity, hash),
            conditions,
        })
    }

    pub fn is_basis(&self) -> bool {
        self.conditions.is_empty()
    }

    /// True when every relation of every condition into this join is in
    /// the optional set; such joins render as LEFT, all others as INNER.
    pub fn is_left(&self, optional: &BTreeSet<String>) -> bool {
        !self.conditions.is_empty()
            && self
                .conditions
                .iter()
                .all(|c| c.rels.iter().all(|r| optional.contains(r)))
    }

    /// Render the ON expression. FK direction is resolved per relation:
    /// the side whose entity is the relation's source holds the FK column,
    /// the other side is referenced by its primary key.
    pub fn on_sql(&self, schema: &Schema, alias_of: impl Fn(&JoinKey) -> String) -> ModelResult<String> {
        let mut terms = Vec::new();
        for condition in &self.conditions {
            let other_alias = alias_of(&condition.other);
            for name in &condition.rels {
                let rel = schema.relation(name)?;
                let target_pk = schema.entity(&rel.target)?.pk_column().to_string();
                let term = if rel.source == self.entity {
                    format!("{}.{} = {}.{}", self.alias, name, other_alias, target_pk)
                } else {
                    format!("{}.{} = {}.{}", other_alias, name, self.alias, target_pk)
                };
                terms.push(term);
            }
        }
        Ok(terms.join(" AND "))
    }
}
