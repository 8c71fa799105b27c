//! The FROM clause: an arena of joins plus rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::BitOr;

use crate::model::Schema;

use super::{AlgebraError, AlgebraResult, Condition, Join, JoinKey};

/// The set of all joins reachable from one or more path roots.
///
/// Joins are stored in an arena keyed by their structural alias, so
/// composing `FromClause`s from different expressions is a plain map
/// union: structurally identical joins land on the same key and collapse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FromClause {
    joins: BTreeMap<JoinKey, Join>,
}

impl FromClause {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or find) the basis join for an entity.
    pub fn basis(&mut self, entity: &str) -> JoinKey {
        let join = Join::basis(entity);
        let key = join.alias.clone();
        self.joins.entry(key.clone()).or_insert(join);
        key
    }

    /// Add (or find) a joined occurrence of an entity.
    pub fn joined(
        &mut self,
        _schema: &Schema,
        entity: &str,
        condition: Condition,
    ) -> AlgebraResult<JoinKey> {
        let join = Join::joined(entity, vec![condition])?;
        let key = join.alias.clone();
        self.joins.entry(key.clone()).or_insert(join);
        Ok(key)
    }

    pub fn alias<'a>(&'a self, key: &'a JoinKey) -> &'a str {
        self.joins.get(key).map(|j| j.alias.as_str()).unwrap_or(key)
    }

    /// All aliases in deterministic order, with their entity names.
    pub fn aliases(&self) -> Vec<(&str, &str)> {
        self.joins
            .values()
            .map(|j| (j.alias.as_str(), j.entity.as_str()))
            .collect()
    }

    /// Basis entities (unconstrained root tables).
    pub fn basis_entities(&self) -> BTreeSet<&str> {
        self.joins
            .values()
            .filter(|j| j.is_basis())
            .map(|j| j.entity.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Render the FROM clause body (without the leading `FROM`).
    ///
    /// Joins are emitted in an order where every referenced alias has
    /// already been introduced: basis joins first, then a deterministic
    /// Kahn walk over the dependency edges. A join graph cycle means the
    /// same entity was reached by two mutually-referencing joins; that is
    /// a programming error and fatal.
    pub fn render(&self, schema: &Schema, optional: &BTreeSet<String>) -> AlgebraResult<String> {
        let mut emitted: BTreeSet<&JoinKey> = BTreeSet::new();
        let mut parts: Vec<String> = Vec::new();

        for join in self.joins.values().filter(|j| j.is_basis()) {
            if parts.is_empty() {
                parts.push(join.entity.clone());
            } else {
                parts.push(format!("CROSS JOIN {}", join.entity));
            }
            emitted.insert(&join.alias);
        }

        let mut remaining: Vec<&Join> = self.joins.values().filter(|j| !j.is_basis()).collect();
        while !remaining.is_empty() {
            let ready_pos = remaining.iter().position(|j| {
                j.conditions.iter().all(|c| emitted.contains(&c.other))
            });
            let Some(pos) = ready_pos else {
                let stuck: Vec<String> =
                    remaining.iter().map(|j| j.alias.clone()).collect();
                return Err(AlgebraError::JoinCycle(stuck));
            };
            let join = remaining.remove(pos);
            let kind = if join.is_left(optional) { "LEFT" } else { "INNER" };
            let on = join.on_sql(schema, |key| self.alias(key).to_string())?;
            parts.push(format!(
                "{} JOIN {} AS {} ON {}",
                kind, join.entity, join.alias, on
            ));
            emitted.insert(&join.alias);
        }

        Ok(parts.join(" "))
    }
}

/// Set union over structural join keys; `From` objects from different
/// expressions compose into one clause for a multi-root query.
impl BitOr for FromClause {
    type Output = FromClause;

    fn bitor(mut self, other: FromClause) -> FromClause {
        self.joins.extend(other.joins);
        self
    }
}
