//! Vertices and snapshot reconstruction.
//!
//! A [`Vertex`] holds the *current* materialized state in plain fields plus
//! the head of its delta chain. Any older state is reconstructed by cloning
//! the materialized record and replaying delta inverses newest-to-oldest
//! until the reader's stop point.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::db::transaction::TransactionId;
use crate::storage::delta::{stops_walk, CommitInfo, Delta, DeltaAction, EdgeLink};
use crate::storage::value::{LabelId, PrimaryKey, PropertyId, PropertyValue};
use crate::storage::View;

/// Cluster-wide vertex identity: the owning primary label plus the primary
/// key. Only resolvable against the shard that owns the key range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId {
    /// Primary label that defines the key space.
    pub primary_label: LabelId,
    /// Primary key within that space.
    pub primary_key: PrimaryKey,
}

impl VertexId {
    /// Builds an id from its parts.
    pub fn new(primary_label: LabelId, primary_key: PrimaryKey) -> Self {
        Self {
            primary_label,
            primary_key,
        }
    }
}

/// A vertex record: materialized current state plus its delta chain head.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Primary key; immutable for the lifetime of the record.
    pub key: PrimaryKey,
    /// Secondary labels (the primary label is implicit per shard).
    pub labels: SmallVec<[LabelId; 4]>,
    /// Non-key properties.
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    /// Incident in-edges.
    pub in_edges: Vec<EdgeLink>,
    /// Incident out-edges.
    pub out_edges: Vec<EdgeLink>,
    /// Logically deleted flag; the record stays in its container until the
    /// garbage collector proves no snapshot can still see it.
    pub deleted: bool,
    /// Head of the undo chain, newest first.
    pub delta: Option<Box<Delta>>,
}

impl Vertex {
    /// Creates an empty, live vertex record for `key`.
    pub fn new(key: PrimaryKey) -> Self {
        Self {
            key,
            labels: SmallVec::new(),
            properties: BTreeMap::new(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            deleted: false,
            delta: None,
        }
    }

    /// True when the materialized record carries `label`.
    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.contains(&label)
    }

    /// Appends a new delta at the chain head.
    pub fn push_delta(&mut self, commit_info: &Arc<CommitInfo>, action: DeltaAction) {
        let next = self.delta.take();
        self.delta = Some(Box::new(Delta::new(action, Arc::clone(commit_info), next)));
    }

    /// Applies one recorded inverse to the materialized fields. Used both by
    /// snapshot reconstruction (on a scratch copy) and by abort unwind (on
    /// the live record).
    pub fn apply_action(&mut self, action: &DeltaAction) {
        match action {
            DeltaAction::AddLabel(label) => {
                if !self.labels.contains(label) {
                    self.labels.push(*label);
                }
            }
            DeltaAction::RemoveLabel(label) => {
                self.labels.retain(|l| l != label);
            }
            DeltaAction::SetProperty { key, value } => {
                if value.is_null() {
                    self.properties.remove(key);
                } else {
                    self.properties.insert(*key, value.clone());
                }
            }
            DeltaAction::AddInEdge(link) => {
                self.in_edges.push(link.clone());
            }
            DeltaAction::AddOutEdge(link) => {
                self.out_edges.push(link.clone());
            }
            DeltaAction::RemoveInEdge(link) => {
                self.in_edges.retain(|l| l.gid != link.gid);
            }
            DeltaAction::RemoveOutEdge(link) => {
                self.out_edges.retain(|l| l.gid != link.gid);
            }
            DeltaAction::RecreateObject => {
                self.deleted = false;
            }
            DeltaAction::DeleteObject => {
                self.deleted = true;
            }
        }
    }

    fn materialized_clone(&self) -> Vertex {
        Vertex {
            key: self.key.clone(),
            labels: self.labels.clone(),
            properties: self.properties.clone(),
            in_edges: self.in_edges.clone(),
            out_edges: self.out_edges.clone(),
            deleted: self.deleted,
            delta: None,
        }
    }

    /// Reconstructs the state visible to the given reader, or `None` when
    /// the vertex does not exist in that snapshot.
    pub fn snapshot(
        &self,
        primary_label: LabelId,
        tx_id: TransactionId,
        start_logical: u64,
        view: View,
    ) -> Option<VertexSnapshot> {
        let mut scratch = self.materialized_clone();
        let mut cur = self.delta.as_deref();
        while let Some(delta) = cur {
            if stops_walk(&delta.commit_info, tx_id, start_logical, view) {
                break;
            }
            scratch.apply_action(&delta.action);
            cur = delta.next.as_deref();
        }
        if scratch.deleted {
            return None;
        }
        Some(VertexSnapshot {
            id: VertexId::new(primary_label, scratch.key),
            labels: scratch.labels,
            properties: scratch.properties,
            in_edges: scratch.in_edges,
            out_edges: scratch.out_edges,
        })
    }
}

/// An immutable reconstruction of a vertex as seen by one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexSnapshot {
    /// The vertex identity.
    pub id: VertexId,
    /// Secondary labels in the snapshot.
    pub labels: SmallVec<[LabelId; 4]>,
    /// Properties in the snapshot.
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    /// In-edges in the snapshot.
    pub in_edges: Vec<EdgeLink>,
    /// Out-edges in the snapshot.
    pub out_edges: Vec<EdgeLink>,
}

impl VertexSnapshot {
    /// True when the snapshot carries `label`.
    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.contains(&label)
    }

    /// Number of incident edges in the snapshot.
    pub fn degree(&self) -> usize {
        self.in_edges.len() + self.out_edges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::delta::CommitState;

    fn key(v: i64) -> PrimaryKey {
        PrimaryKey(vec![PropertyValue::Int(v)])
    }

    #[test]
    fn test_uncommitted_create_invisible_to_others() {
        let owner = TransactionId::new(5);
        let info = Arc::new(CommitInfo::uncommitted(owner));
        let mut vertex = Vertex::new(key(1));
        vertex.push_delta(&info, DeltaAction::DeleteObject);

        let label = LabelId::new(1);
        // The owner sees it under the NEW view, nobody else does.
        assert!(vertex.snapshot(label, owner, 5, View::New).is_some());
        assert!(vertex.snapshot(label, owner, 5, View::Old).is_none());
        let other = TransactionId::new(6);
        assert!(vertex.snapshot(label, other, 6, View::Old).is_none());
        assert!(vertex.snapshot(label, other, 6, View::New).is_none());
    }

    #[test]
    fn test_committed_create_visible_from_commit_on() {
        let owner = TransactionId::new(5);
        let info = Arc::new(CommitInfo::uncommitted(owner));
        let mut vertex = Vertex::new(key(1));
        vertex.push_delta(&info, DeltaAction::DeleteObject);
        info.publish(10);
        assert_eq!(info.state(), CommitState::Committed(10));

        let label = LabelId::new(1);
        let before = TransactionId::new(8);
        let after = TransactionId::new(12);
        assert!(vertex.snapshot(label, before, 8, View::Old).is_none());
        assert!(vertex.snapshot(label, after, 12, View::Old).is_some());
    }

    #[test]
    fn test_property_inverse_restores_old_value() {
        let t1 = TransactionId::new(5);
        let info1 = Arc::new(CommitInfo::uncommitted(t1));
        let mut vertex = Vertex::new(key(1));
        vertex.push_delta(&info1, DeltaAction::DeleteObject);
        let prop = PropertyId::new(2);
        vertex.properties.insert(prop, PropertyValue::Int(1));
        vertex.push_delta(
            &info1,
            DeltaAction::SetProperty {
                key: prop,
                value: PropertyValue::Null,
            },
        );
        info1.publish(10);

        // A second committed transaction overwrites the property.
        let t2 = TransactionId::new(15);
        let info2 = Arc::new(CommitInfo::uncommitted(t2));
        vertex.properties.insert(prop, PropertyValue::Int(2));
        vertex.push_delta(
            &info2,
            DeltaAction::SetProperty {
                key: prop,
                value: PropertyValue::Int(1),
            },
        );
        info2.publish(20);

        let label = LabelId::new(1);
        let mid = vertex
            .snapshot(label, TransactionId::new(12), 12, View::Old)
            .unwrap();
        assert_eq!(mid.properties.get(&prop), Some(&PropertyValue::Int(1)));
        let late = vertex
            .snapshot(label, TransactionId::new(25), 25, View::Old)
            .unwrap();
        assert_eq!(late.properties.get(&prop), Some(&PropertyValue::Int(2)));
    }
}
