//! Property values, typed ids and primary keys.
//!
//! [`PropertyValue`] is the dynamic value type carried by vertex and edge
//! properties and by primary keys. Values are totally ordered so that
//! [`PrimaryKey`]s can partition a shard's key space: ordering compares a
//! type rank first and the payload second, with the exception that ints and
//! doubles compare numerically against each other.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifier of a vertex label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LabelId(u64);

impl LabelId {
    /// Wraps a raw id (ids are assigned by the cluster's name mapping).
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifier of a property key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PropertyId(u64);

impl PropertyId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Identifier of an edge type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeTypeId(u64);

impl EdgeTypeId {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Globally unique edge id, assigned by the cluster coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gid(u64);

impl Gid {
    /// Wraps a raw id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A dynamically typed property value.
///
/// `Temporal` carries microseconds since the Unix epoch. `Double` keeps IEEE
/// semantics for arithmetic but participates in the total order via
/// `f64::total_cmp`, so values (including NaN) are usable as map keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Absent value; also used to erase a property on write.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Microseconds since the Unix epoch.
    Temporal(i64),
    /// Ordered list of values.
    List(Vec<PropertyValue>),
    /// String-keyed map of values.
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            // Ints and doubles share a rank; they compare numerically.
            PropertyValue::Int(_) | PropertyValue::Double(_) => 2,
            PropertyValue::String(_) => 3,
            PropertyValue::Temporal(_) => 4,
            PropertyValue::List(_) => 5,
            PropertyValue::Map(_) => 6,
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use PropertyValue::*;
        match (self, other) {
            (Int(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Int(b)) => a.total_cmp(&(*b as f64)),
            _ => match self.type_rank().cmp(&other.type_rank()) {
                Ordering::Equal => match (self, other) {
                    (Null, Null) => Ordering::Equal,
                    (Bool(a), Bool(b)) => a.cmp(b),
                    (Int(a), Int(b)) => a.cmp(b),
                    (Double(a), Double(b)) => a.total_cmp(b),
                    (String(a), String(b)) => a.cmp(b),
                    (Temporal(a), Temporal(b)) => a.cmp(b),
                    (List(a), List(b)) => a.cmp(b),
                    (Map(a), Map(b)) => a.cmp(b),
                    _ => unreachable!("equal type ranks imply equal variants"),
                },
                rank_order => rank_order,
            },
        }
    }
}

/// An ordered sequence of property values identifying a vertex.
///
/// Keys compare lexicographically element by element, which defines the
/// shard partitioning order: a shard owns the half-open range
/// `[min_primary_key, max_primary_key)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<PropertyValue>);

impl From<Vec<PropertyValue>> for PrimaryKey {
    fn from(values: Vec<PropertyValue>) -> Self {
        Self(values)
    }
}

impl PrimaryKey {
    /// The key's property values in schema order.
    pub fn values(&self) -> &[PropertyValue] {
        &self.0
    }
}
