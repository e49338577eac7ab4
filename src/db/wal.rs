//! Durability collaborator boundary.
//!
//! The shard does not persist anything itself. At commit it hands the
//! transaction's forward operations, stamped with the commit timestamp, to
//! a [`WalSink`]; the durability collaborator is expected to have made the
//! write durable and ordered before the commit timestamp was supplied. On
//! crash recovery the collaborator feeds the same linear stream back
//! through [`replay_into`] to rebuild object state from empty, before the
//! shard accepts new accessors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::hlc::Hlc;
use crate::db::shard::{Accessor, Shard};
use crate::error::{Result, ShardError};
use crate::storage::value::{EdgeTypeId, Gid, LabelId, PrimaryKey, PropertyId, PropertyValue};
use crate::storage::vertex::VertexId;

/// A forward operation as it appears in the durability stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalPayload {
    /// A vertex was created.
    VertexCreate {
        /// Primary key.
        key: PrimaryKey,
        /// Secondary labels at creation.
        labels: Vec<LabelId>,
        /// Non-key properties at creation.
        properties: Vec<(PropertyId, PropertyValue)>,
    },
    /// A vertex was deleted.
    VertexDelete {
        /// Primary key.
        key: PrimaryKey,
    },
    /// A label was added to a vertex.
    AddLabel {
        /// Primary key.
        key: PrimaryKey,
        /// The label.
        label: LabelId,
    },
    /// A label was removed from a vertex.
    RemoveLabel {
        /// Primary key.
        key: PrimaryKey,
        /// The label.
        label: LabelId,
    },
    /// A vertex property was written (`Null` erases).
    SetProperty {
        /// Primary key.
        key: PrimaryKey,
        /// Property key.
        property: PropertyId,
        /// New value.
        value: PropertyValue,
    },
    /// An edge was created.
    EdgeCreate {
        /// Globally unique id.
        gid: Gid,
        /// Source endpoint.
        from: VertexId,
        /// Target endpoint.
        to: VertexId,
        /// Edge type.
        edge_type: EdgeTypeId,
    },
    /// An edge was deleted.
    EdgeDelete {
        /// Globally unique id.
        gid: Gid,
        /// Source endpoint.
        from: VertexId,
        /// Target endpoint.
        to: VertexId,
    },
    /// An edge property was written (`Null` erases).
    SetEdgeProperty {
        /// Globally unique id.
        gid: Gid,
        /// Property key.
        property: PropertyId,
        /// New value.
        value: PropertyValue,
    },
    /// Marks the end of one committed transaction.
    TransactionEnd,
}

/// One entry of the durability stream: a payload stamped with the logical
/// component of the commit timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Logical commit timestamp of the owning transaction.
    pub timestamp: u64,
    /// The operation.
    pub payload: WalPayload,
}

impl WalRecord {
    /// Encodes the record as a JSON line.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ShardError::Config(format!("wal encode: {e}")))
    }

    /// Decodes a record from a JSON line.
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| ShardError::Config(format!("wal decode: {e}")))
    }
}

/// Receives the linear stream of committed operations.
pub trait WalSink: Send + Sync {
    /// Appends one record. Called after the ordering collaborator has
    /// guaranteed durability, never before.
    fn append(&self, record: WalRecord);
}

/// An in-memory sink, usable as a test double or as a staging buffer for an
/// external durability layer.
#[derive(Debug, Default)]
pub struct MemoryWal {
    records: Mutex<Vec<WalRecord>>,
}

impl MemoryWal {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything appended so far.
    pub fn records(&self) -> Vec<WalRecord> {
        self.records.lock().clone()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl WalSink for MemoryWal {
    fn append(&self, record: WalRecord) {
        self.records.lock().push(record);
    }
}

/// Replays a durability stream into an empty shard.
///
/// Records between two `TransactionEnd` markers are applied through one
/// accessor and committed with the recorded timestamp, so replayed state
/// carries the original commit order. A stream that ends inside a
/// transaction has its tail discarded, matching crash semantics: the
/// ordering collaborator never confirmed that commit.
pub fn replay_into<I>(shard: &Shard, records: I) -> Result<()>
where
    I: IntoIterator<Item = WalRecord>,
{
    let mut open: Option<Accessor<'_>> = None;
    let mut applied = 0usize;
    for record in records {
        let accessor = open.get_or_insert_with(|| shard.access(None));
        match record.payload {
            WalPayload::VertexCreate {
                key,
                labels,
                properties,
            } => {
                accessor.create_vertex(&labels, key.0, properties)?;
            }
            WalPayload::VertexDelete { key } => {
                accessor.delete_vertex(&key)?;
            }
            WalPayload::AddLabel { key, label } => {
                accessor.add_label(&key, label)?;
            }
            WalPayload::RemoveLabel { key, label } => {
                accessor.remove_label(&key, label)?;
            }
            WalPayload::SetProperty {
                key,
                property,
                value,
            } => {
                accessor.set_property(&key, property, value)?;
            }
            WalPayload::EdgeCreate {
                gid,
                from,
                to,
                edge_type,
            } => {
                accessor.create_edge(from, to, edge_type, gid)?;
            }
            WalPayload::EdgeDelete { gid, from, to } => {
                accessor.delete_edge(&from, &to, gid)?;
            }
            WalPayload::SetEdgeProperty {
                gid,
                property,
                value,
            } => {
                accessor.set_edge_property(gid, property, value)?;
            }
            WalPayload::TransactionEnd => {
                if let Some(accessor) = open.take() {
                    accessor.commit(Hlc::from_logical(record.timestamp))?;
                    applied += 1;
                }
            }
        }
    }
    if open.is_some() {
        debug!("wal stream ended inside a transaction; discarding the tail");
    }
    debug!(transactions = applied, "wal replay finished");
    Ok(())
}
