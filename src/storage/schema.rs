//! Primary-key schemas and validation.
//!
//! Each primary label carries a schema: the ordered list of typed properties
//! that make up the primary key of vertices under that label. Vertex
//! creation validates the supplied key against the schema before any delta
//! is created.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Result, ShardError};
use crate::storage::value::{LabelId, PropertyId, PropertyValue};

/// Scalar types permitted in a primary-key schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    /// Boolean key part.
    Bool,
    /// Integer key part.
    Int,
    /// Double key part.
    Double,
    /// String key part.
    String,
    /// Temporal key part (microseconds since epoch).
    Temporal,
}

/// One typed property of a primary-key schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaProperty {
    /// The property holding this key part.
    pub property: PropertyId,
    /// Its required type.
    pub kind: SchemaType,
}

fn kind_of(value: &PropertyValue) -> Option<SchemaType> {
    match value {
        PropertyValue::Bool(_) => Some(SchemaType::Bool),
        PropertyValue::Int(_) => Some(SchemaType::Int),
        PropertyValue::Double(_) => Some(SchemaType::Double),
        PropertyValue::String(_) => Some(SchemaType::String),
        PropertyValue::Temporal(_) => Some(SchemaType::Temporal),
        PropertyValue::Null | PropertyValue::List(_) | PropertyValue::Map(_) => None,
    }
}

/// Registry of primary-key schemas, keyed by primary label.
#[derive(Debug, Default)]
pub struct Schemas {
    inner: RwLock<HashMap<LabelId, Vec<SchemaProperty>>>,
}

impl Schemas {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema for `label`. Returns `false` when a schema for the
    /// label already exists (the existing one is kept).
    pub fn create_schema(&self, label: LabelId, properties: Vec<SchemaProperty>) -> bool {
        let mut inner = self.inner.write();
        if inner.contains_key(&label) {
            return false;
        }
        inner.insert(label, properties);
        true
    }

    /// Drops the schema for `label`. Returns `false` when none existed.
    pub fn drop_schema(&self, label: LabelId) -> bool {
        self.inner.write().remove(&label).is_some()
    }

    /// The schema registered for `label`, if any.
    pub fn get(&self, label: LabelId) -> Option<Vec<SchemaProperty>> {
        self.inner.read().get(&label).cloned()
    }

    /// All registered schemas.
    pub fn list(&self) -> Vec<(LabelId, Vec<SchemaProperty>)> {
        let mut all: Vec<_> = self
            .inner
            .read()
            .iter()
            .map(|(label, props)| (*label, props.clone()))
            .collect();
        all.sort_by_key(|(label, _)| *label);
        all
    }
}

/// Validates a primary key against a schema: the value count and every value
/// type must match. Fails fast with `SchemaViolation` before any delta is
/// created.
pub fn validate_primary_key(schema: &[SchemaProperty], values: &[PropertyValue]) -> Result<()> {
    if schema.len() != values.len() {
        return Err(ShardError::SchemaViolation(format!(
            "primary key has {} values, schema expects {}",
            values.len(),
            schema.len()
        )));
    }
    for (part, value) in schema.iter().zip(values) {
        match kind_of(value) {
            Some(kind) if kind == part.kind => {}
            _ => {
                return Err(ShardError::SchemaViolation(format!(
                    "primary key property {} expects {:?}",
                    part.property.as_u64(),
                    part.kind
                )))
            }
        }
    }
    Ok(())
}
