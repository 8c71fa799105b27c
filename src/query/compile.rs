//! Query assembly: FROM union, guards, grouping and row identity.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::expr::RenderCtx;
use super::{Expr, QueryError, QueryResult};
use crate::algebra::{FromClause, Path};
use crate::hash::content_hash;
use crate::model::{Schema, SOFT_DELETE_COLUMN};

/// Suffix of the per-basis primary-key output column.
pub const KEY_SUFFIX: &str = "__key";
/// Suffix of the per-basis synthetic identity output column.
pub const IDENTITY_SUFFIX: &str = "__identity";

/// A declarative SELECT: named output expressions over a basis, plus
/// predicates and join-optionality hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    select: BTreeMap<String, Expr>,
    basis: BTreeSet<String>,
    predicate: Option<Expr>,
    /// Post-aggregation predicate (HAVING).
    having: Option<Expr>,
    /// Relations that may be absent; joins using only these render LEFT.
    optional: BTreeSet<String>,
    /// Dotted `entity.attr` references exempt from the NOT-NULL guard.
    nullable: BTreeSet<String>,
}

/// The rendered output of [`Query::compile`].
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    /// Output column names, in SELECT order.
    pub columns: Vec<String>,
    /// Content hash of the query structure; stable across runs.
    pub hash: String,
    /// The basis entities fixing the query's cardinality.
    pub basis: BTreeSet<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, name: &str, expr: Expr) -> Self {
        self.select.insert(name.into(), expr);
        self
    }

    pub fn with_basis(mut self, entity: &str) -> Self {
        self.basis.insert(entity.into());
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    pub fn having(mut self, predicate: Expr) -> Self {
        self.having = Some(predicate);
        self
    }

    pub fn optional_rel(mut self, name: &str) -> Self {
        self.optional.insert(name.into());
        self
    }

    pub fn nullable(mut self, dotted: &str) -> Self {
        self.nullable.insert(dotted.into());
        self
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.select.keys().map(|s| s.as_str())
    }

    /// Every attribute path the query mentions, in select/predicate/having
    /// order. Drives both FROM construction and footprint inference.
    pub fn paths(&self) -> Vec<Path> {
        let mut out = Vec::new();
        for expr in self.select.values() {
            expr.collect_paths(&mut out);
        }
        if let Some(p) = &self.predicate {
            p.collect_paths(&mut out);
        }
        if let Some(h) = &self.having {
            h.collect_paths(&mut out);
        }
        out
    }

    /// Every scalar subquery mentioned in selects, predicate or having.
    pub fn subqueries(&self) -> Vec<&Query> {
        let mut out = Vec::new();
        for expr in self.select.values() {
            expr.collect_subqueries(&mut out);
        }
        if let Some(p) = &self.predicate {
            p.collect_subqueries(&mut out);
        }
        if let Some(h) = &self.having {
            h.collect_subqueries(&mut out);
        }
        out
    }

    /// Resolve the basis: explicit, or inferred when every referenced path
    /// is anchored at a single entity. Anything else is a compile error.
    pub fn resolve_basis(&self) -> QueryResult<BTreeSet<String>> {
        if !self.basis.is_empty() {
            return Ok(self.basis.clone());
        }
        let terminals: BTreeSet<String> = self
            .paths()
            .iter()
            .map(|p| p.terminal().to_string())
            .collect();
        match terminals.len() {
            0 => Err(QueryError::NoBasis),
            1 => Ok(terminals),
            _ => Err(QueryError::AmbiguousBasis(
                terminals.into_iter().collect(),
            )),
        }
    }

    /// Render the full SELECT statement.
    pub fn compile(&self, schema: &Schema) -> QueryResult<CompiledQuery> {
        let hash = content_hash(self)?;
        let basis = self.resolve_basis()?;

        let mut from = FromClause::new();
        for entity in &basis {
            schema.entity(entity)?;
            from.basis(entity);
        }

        let grouping =
            self.select.values().any(Expr::is_aggregate) || self.having.is_some();

        let mut columns: Vec<String> = Vec::new();
        let mut select_parts: Vec<String> = Vec::new();
        let mut group_parts: Vec<String> = Vec::new();

        // Row identity per basis alias: the primary key, and a synthetic
        // identity value (MAX-aggregated under grouping since the hash is
        // functionally determined by the key).
        for entity in &basis {
            let pk = schema.entity(entity)?.pk_column().to_string();
            let key_col = format!("{}{}", entity, KEY_SUFFIX);
            let identity_col = format!("{}{}", entity, IDENTITY_SUFFIX);
            let tag: String = hash.chars().take(8).collect();
            let identity = format!("({}.{} || ':{}')", entity, pk, tag);

            select_parts.push(format!("{}.{} AS {}", entity, pk, key_col));
            columns.push(key_col);
            if grouping {
                select_parts.push(format!("MAX({}) AS {}", identity, identity_col));
                group_parts.push(format!("{}.{}", entity, pk));
            } else {
                select_parts.push(format!("{} AS {}", identity, identity_col));
            }
            columns.push(identity_col);
        }

        for (name, expr) in &self.select {
            let mut ctx = RenderCtx {
                schema,
                from: &mut from,
                query_hash: &hash,
                identity_as_pk: false,
            };
            let sql = expr.render(&mut ctx)?;
            select_parts.push(format!("{} AS {}", sql, name));
            columns.push(name.clone());
            if grouping && !expr.is_aggregate() {
                let mut group_ctx = RenderCtx {
                    schema,
                    from: &mut from,
                    query_hash: &hash,
                    identity_as_pk: true,
                };
                group_parts.push(expr.render(&mut group_ctx)?);
            }
        }

        let mut where_terms: Vec<String> = Vec::new();
        if let Some(predicate) = &self.predicate {
            let mut ctx = RenderCtx {
                schema,
                from: &mut from,
                query_hash: &hash,
                identity_as_pk: false,
            };
            where_terms.push(predicate.render(&mut ctx)?);
        }

        let having_sql = match &self.having {
            Some(predicate) => {
                let mut ctx = RenderCtx {
                    schema,
                    from: &mut from,
                    query_hash: &hash,
                    identity_as_pk: false,
                };
                Some(predicate.render(&mut ctx)?)
            }
            None => None,
        };

        // NOT-NULL guard for every referenced attribute not marked
        // nullable. Attributes reached through optional relations should
        // be marked nullable by the caller, or the guard re-tightens the
        // LEFT join.
        let mut guards: BTreeSet<String> = BTreeSet::new();
        for path in self.paths() {
            let head = path.head()?;
            let attr = match path.attr_name() {
                Some(a) => a,
                None => continue,
            };
            if self.nullable.contains(&format!("{}.{}", head, attr)) {
                continue;
            }
            let (alias, column) = path.column(schema, &mut from)?;
            guards.insert(format!("{}.{} IS NOT NULL", alias, column));
        }
        where_terms.extend(guards);

        // Soft-delete exclusion for every joined alias.
        for (alias, _entity) in from.aliases() {
            where_terms.push(format!(
                "COALESCE({}.{}, 0) = 0",
                alias, SOFT_DELETE_COLUMN
            ));
        }

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_parts.join(", "),
            from.render(schema, &self.optional)?
        );
        if !where_terms.is_empty() {
            sql.push_str(&format!(" WHERE {}", where_terms.join(" AND ")));
        }
        if grouping && !group_parts.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", group_parts.join(", ")));
        }
        if let Some(having) = having_sql {
            sql.push_str(&format!(" HAVING {}", having));
        }

        Ok(CompiledQuery {
            sql,
            columns,
            hash,
            basis,
        })
    }
}
