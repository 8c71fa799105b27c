//! The declarative schema model: entities, attributes and relations.
//!
//! The model is the ground truth everything else compiles against. Entities
//! and relations are immutable value objects once constructed; the
//! [`Schema`] container owns the full set and derives a relation graph
//! used by the path algebra and the scheduler.

mod entity;
mod relation;
mod schema;

pub use entity::{Attr, AttrType, Entity, SOFT_DELETE_COLUMN};
pub use relation::{OnDelete, Rel, RelTup};
pub use schema::Schema;

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while constructing or inspecting the schema model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Referenced an entity that doesn't exist.
    #[error("unknown entity: '{0}'")]
    UnknownEntity(String),

    /// Referenced an attribute that doesn't exist on an entity.
    #[error("unknown attribute '{attr}' on entity '{entity}'")]
    UnknownAttr { entity: String, attr: String },

    /// Referenced a relation that doesn't exist.
    #[error("unknown relation: '{0}'")]
    UnknownRelation(String),

    /// Attribute names must be unique within an entity.
    #[error("duplicate attribute '{attr}' on entity '{entity}'")]
    DuplicateAttr { entity: String, attr: String },

    /// Relation names must be unique across the schema so that path
    /// specifications can address them by name alone.
    #[error("duplicate relation name: '{0}'")]
    DuplicateRelation(String),

    /// Entity names must be unique within a schema.
    #[error("duplicate entity: '{0}'")]
    DuplicateEntity(String),

    /// The primary-key column, soft-delete flag and entity name are
    /// reserved and may not be used as attribute names.
    #[error("reserved name '{name}' used as attribute on entity '{entity}'")]
    ReservedName { entity: String, name: String },

    /// At most one attribute per entity may be designated as partition.
    #[error("entity '{0}' declares more than one partition attribute")]
    MultiplePartitions(String),

    /// A relation targets an entity missing from the schema.
    #[error("relation '{rel}' on entity '{entity}' targets unknown entity '{target}'")]
    DanglingRelation {
        entity: String,
        rel: String,
        target: String,
    },

    /// A relation endpoint lookup was given a node not on the edge.
    #[error("entity '{node}' is not an endpoint of relation '{rel}'")]
    NotAnEndpoint { rel: String, node: String },

    /// A value could not be cast to an attribute's declared type.
    #[error("cannot cast {value} to {ty:?}")]
    Cast { value: String, ty: AttrType },
}
