//! Relations between entities.

use serde::{Deserialize, Serialize};

use super::{ModelError, ModelResult};

/// What happens to the source row when the target row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDelete {
    Restrict,
    Cascade,
    SetNull,
}

/// A materialized relation: a directed, named edge `source -> target`.
///
/// The foreign-key column lives on the source entity and is named after
/// the relation itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rel {
    pub name: String,
    pub source: String,
    pub target: String,
    /// The edge contributes to the source entity's natural key.
    pub identifying: bool,
    pub on_delete: OnDelete,
}

impl Rel {
    pub fn new(
        name: &str,
        source: &str,
        target: &str,
        identifying: bool,
        on_delete: OnDelete,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            identifying,
            on_delete,
        }
    }

    /// The opposite endpoint of the edge, given one endpoint.
    ///
    /// Symmetric lookup used pervasively by the path algebra: traversal
    /// specifications do not care which side holds the FK column.
    pub fn other(&self, node: &str) -> ModelResult<&str> {
        if node == self.source {
            Ok(&self.target)
        } else if node == self.target {
            Ok(&self.source)
        } else {
            Err(ModelError::NotAnEndpoint {
                rel: self.name.clone(),
                node: node.into(),
            })
        }
    }

    pub fn tup(&self) -> RelTup {
        RelTup {
            name: self.name.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }
}

/// Lightweight name-only reference to a relation.
///
/// Carried by paths and graph edges where the delete policy and
/// identifying flag are irrelevant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelTup {
    pub name: String,
    pub source: String,
    pub target: String,
}

impl RelTup {
    /// See [`Rel::other`].
    pub fn other(&self, node: &str) -> ModelResult<&str> {
        if node == self.source {
            Ok(&self.target)
        } else if node == self.target {
            Ok(&self.source)
        } else {
            Err(ModelError::NotAnEndpoint {
                rel: self.name.clone(),
                node: node.into(),
            })
        }
    }
}
