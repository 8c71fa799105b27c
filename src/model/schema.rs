//! The schema container and its derived relation graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use super::{Entity, ModelError, ModelResult, Rel, RelTup, SOFT_DELETE_COLUMN};

/// Owns the full entity set and the relation graph derived from it.
///
/// Entities are immutable for the duration of a run; the graph edges point
/// `source -> target` and are weighted with [`RelTup`]s so path search can
/// walk the reversed graph cheaply.
#[derive(Debug, Serialize)]
pub struct Schema {
    entities: BTreeMap<String, Entity>,
    #[serde(skip)]
    graph: DiGraph<String, RelTup>,
    #[serde(skip)]
    node_indices: HashMap<String, NodeIndex>,
}

impl Schema {
    /// Build and validate a schema from its entities.
    pub fn new(entities: Vec<Entity>) -> ModelResult<Self> {
        let mut map: BTreeMap<String, Entity> = BTreeMap::new();
        for entity in entities {
            if map.contains_key(entity.name()) {
                return Err(ModelError::DuplicateEntity(entity.name().into()));
            }
            map.insert(entity.name().to_string(), entity);
        }

        // Relation names are addressable schema-wide, so they must be unique
        // and may not dangle.
        let mut rel_names: BTreeSet<&str> = BTreeSet::new();
        for entity in map.values() {
            for rel in entity.rels() {
                if !rel_names.insert(&rel.name) {
                    return Err(ModelError::DuplicateRelation(rel.name.clone()));
                }
                if !map.contains_key(&rel.target) {
                    return Err(ModelError::DanglingRelation {
                        entity: entity.name().into(),
                        rel: rel.name.clone(),
                        target: rel.target.clone(),
                    });
                }
            }
        }

        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();
        for name in map.keys() {
            let idx = graph.add_node(name.clone());
            node_indices.insert(name.clone(), idx);
        }
        for entity in map.values() {
            for rel in entity.rels() {
                let from = node_indices[entity.name()];
                let to = node_indices[&rel.target];
                graph.add_edge(from, to, rel.tup());
            }
        }

        Ok(Self {
            entities: map,
            graph,
            node_indices,
        })
    }

    pub fn entity(&self, name: &str) -> ModelResult<&Entity> {
        self.entities
            .get(name)
            .ok_or_else(|| ModelError::UnknownEntity(name.into()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.keys().map(|s| s.as_str()).collect()
    }

    /// Look up a relation by its schema-wide unique name.
    pub fn relation(&self, name: &str) -> ModelResult<&Rel> {
        self.entities
            .values()
            .find_map(|e| e.rel(name))
            .ok_or_else(|| ModelError::UnknownRelation(name.into()))
    }

    /// Relations whose `target` is the given entity (reversed-graph view).
    pub fn relations_into(&self, target: &str) -> Vec<&Rel> {
        self.entities
            .values()
            .flat_map(|e| e.rels())
            .filter(|r| r.target == target)
            .collect()
    }

    pub fn graph(&self) -> &DiGraph<String, RelTup> {
        &self.graph
    }

    pub fn node_index(&self, entity: &str) -> Option<NodeIndex> {
        self.node_indices.get(entity).copied()
    }

    /// CREATE TABLE statements for all entities.
    pub fn ddl(&self) -> Vec<String> {
        let mut statements = Vec::new();
        for entity in self.entities.values() {
            statements.extend(create_table_ddl(entity));
        }
        statements
    }

    /// DROP TABLE statements, in an order safe under FK constraints
    /// (not needed for sqlite with pragmas off, harmless elsewhere).
    pub fn drop_ddl(&self) -> Vec<String> {
        self.entities
            .keys()
            .map(|name| format!("DROP TABLE IF EXISTS {}", name))
            .collect()
    }

    /// Additive migration: ALTER statements for columns missing from an
    /// existing deployment. `existing` maps table name to its columns;
    /// tables absent from the map get full CREATEs.
    pub fn migrate_ddl(&self, existing: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
        let mut statements = Vec::new();
        for entity in self.entities.values() {
            match existing.get(entity.name()) {
                None => statements.extend(create_table_ddl(entity)),
                Some(cols) => {
                    for attr in entity.attrs() {
                        if !cols.contains(&attr.name) {
                            statements.push(format!(
                                "ALTER TABLE {} ADD COLUMN {} {}",
                                entity.name(),
                                attr.name,
                                attr.attr_type.sql_type()
                            ));
                        }
                    }
                    for rel in entity.rels() {
                        if !cols.contains(&rel.name) {
                            statements.push(format!(
                                "ALTER TABLE {} ADD COLUMN {}",
                                entity.name(),
                                rel.name
                            ));
                        }
                    }
                }
            }
        }
        statements
    }

    /// Every data column in the schema, dotted as `entity.column`.
    ///
    /// Used by the scheduler's completeness check.
    pub fn all_columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for entity in self.entities.values() {
            for col in entity.columns() {
                out.insert(format!("{}.{}", entity.name(), col));
            }
        }
        out
    }
}

/// CREATE TABLE (plus index) statements for one entity.
///
/// Primary-key and FK columns are declared without a type so that the
/// storage engine preserves whatever key representation the loader
/// produced (explicit integer keys or synthetic hash keys).
fn create_table_ddl(entity: &Entity) -> Vec<String> {
    let mut cols = vec![format!("{} PRIMARY KEY", entity.pk_column())];
    for attr in entity.attrs() {
        let mut col = format!("{} {}", attr.name, attr.attr_type.sql_type());
        if let Some(default) = &attr.default {
            col.push_str(&format!(" DEFAULT {}", default.sql_literal()));
        }
        cols.push(col);
    }
    for rel in entity.rels() {
        let target_pk = format!("{}_id", rel.target);
        cols.push(format!(
            "{} REFERENCES {}({})",
            rel.name, rel.target, target_pk
        ));
    }
    cols.push(format!("{} INTEGER DEFAULT 0", SOFT_DELETE_COLUMN));

    let mut statements = vec![format!(
        "CREATE TABLE {} ({})",
        entity.name(),
        cols.join(", ")
    )];
    for attr in entity.attrs().iter().filter(|a| a.indexed) {
        statements.push(format!(
            "CREATE INDEX idx_{}_{} ON {} ({})",
            entity.name(),
            attr.name,
            entity.name(),
            attr.name
        ));
    }
    statements
}
