//! Entities and their attributes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{ModelError, ModelResult, Rel};
use crate::value::Value;

/// Column used for soft deletion. Rows with a truthy value here are
/// excluded from every compiled query.
pub const SOFT_DELETE_COLUMN: &str = "_removed";

/// Logical attribute types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Int,
    Float,
    Text,
    Bool,
}

impl AttrType {
    /// SQL column type for DDL generation.
    pub fn sql_type(&self) -> &'static str {
        match self {
            AttrType::Int => "INTEGER",
            AttrType::Float => "REAL",
            AttrType::Text => "TEXT",
            AttrType::Bool => "INTEGER",
        }
    }

    /// Cast a runtime value to this attribute type.
    ///
    /// Null always passes through; numeric widening and lexical parses are
    /// accepted, everything else is a cast error.
    pub fn cast(&self, value: Value) -> ModelResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let err = |v: &Value, ty: AttrType| ModelError::Cast {
            value: v.to_string(),
            ty,
        };
        match self {
            AttrType::Int => match value {
                Value::Int(i) => Ok(Value::Int(i)),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                Value::Float(f) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
                Value::Text(ref s) => s
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| err(&value, *self)),
                ref v => Err(err(v, *self)),
            },
            AttrType::Float => match value {
                Value::Float(f) => Ok(Value::Float(f)),
                Value::Int(i) => Ok(Value::Float(i as f64)),
                Value::Text(ref s) => s
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| err(&value, *self)),
                ref v => Err(err(v, *self)),
            },
            AttrType::Text => Ok(Value::Text(value.to_string())),
            AttrType::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                ref v => Err(err(v, *self)),
            },
        }
    }
}

/// An attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr {
    pub name: String,
    pub attr_type: AttrType,
    /// Participates in the entity's natural (business) key.
    pub identifying: bool,
    pub default: Option<Value>,
    pub indexed: bool,
    /// Discriminator column used to split storage.
    pub partition: bool,
}

impl Attr {
    pub fn new(name: &str, attr_type: AttrType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            identifying: false,
            default: None,
            indexed: false,
            partition: false,
        }
    }

    pub fn identifying(mut self) -> Self {
        self.identifying = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn partition(mut self) -> Self {
        self.partition = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// An entity: a named table with attributes and outgoing relations.
///
/// Immutable once constructed; [`Entity::new`] validates all invariants
/// up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    name: String,
    attrs: Vec<Attr>,
    rels: Vec<Rel>,
    pk_column: String,
}

impl Entity {
    /// Construct a validated entity.
    ///
    /// The synthetic primary-key column is named `{name}_id`. Relations
    /// passed here must have this entity as their source.
    pub fn new(name: &str, attrs: Vec<Attr>, rels: Vec<Rel>) -> ModelResult<Self> {
        let pk_column = format!("{}_id", name);
        let mut seen: HashSet<&str> = HashSet::new();
        let mut partitions = 0usize;

        for attr in &attrs {
            if attr.name == pk_column || attr.name == SOFT_DELETE_COLUMN || attr.name == name {
                return Err(ModelError::ReservedName {
                    entity: name.into(),
                    name: attr.name.clone(),
                });
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(ModelError::DuplicateAttr {
                    entity: name.into(),
                    attr: attr.name.clone(),
                });
            }
            if attr.partition {
                partitions += 1;
            }
        }
        if partitions > 1 {
            return Err(ModelError::MultiplePartitions(name.into()));
        }

        Ok(Self {
            name: name.into(),
            attrs,
            rels,
            pk_column,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pk_column(&self) -> &str {
        &self.pk_column
    }

    pub fn attrs(&self) -> &[Attr] {
        &self.attrs
    }

    pub fn rels(&self) -> &[Rel] {
        &self.rels
    }

    pub fn attr(&self, name: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn rel(&self, name: &str) -> Option<&Rel> {
        self.rels.iter().find(|r| r.name == name)
    }

    /// Attribute names participating in the natural key, in declaration order.
    pub fn identifying_attrs(&self) -> Vec<&str> {
        self.attrs
            .iter()
            .filter(|a| a.identifying)
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Relation names participating in the natural key, in declaration order.
    pub fn identifying_rels(&self) -> Vec<&str> {
        self.rels
            .iter()
            .filter(|r| r.identifying)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// All data column names: attributes followed by relation FK columns.
    pub fn columns(&self) -> Vec<&str> {
        self.attrs
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.rels.iter().map(|r| r.name.as_str()))
            .collect()
    }
}
