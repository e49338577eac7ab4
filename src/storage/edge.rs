//! Edges and snapshot reconstruction.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::transaction::TransactionId;
use crate::storage::delta::{stops_walk, CommitInfo, Delta, DeltaAction};
use crate::storage::value::{EdgeTypeId, Gid, PropertyId, PropertyValue};
use crate::storage::vertex::VertexId;
use crate::storage::View;

/// An edge record: materialized current state plus its delta chain head.
///
/// Endpoints are stored by [`VertexId`]; one of them may live on another
/// shard, in which case it is a reference only and never resolved locally.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Globally unique id.
    pub gid: Gid,
    /// Source endpoint.
    pub from: VertexId,
    /// Target endpoint.
    pub to: VertexId,
    /// Edge type.
    pub edge_type: EdgeTypeId,
    /// Edge properties (empty unless enabled by configuration).
    pub properties: BTreeMap<PropertyId, PropertyValue>,
    /// Logically deleted flag.
    pub deleted: bool,
    /// Head of the undo chain, newest first.
    pub delta: Option<Box<Delta>>,
}

impl Edge {
    /// Creates a live edge record.
    pub fn new(gid: Gid, from: VertexId, to: VertexId, edge_type: EdgeTypeId) -> Self {
        Self {
            gid,
            from,
            to,
            edge_type,
            properties: BTreeMap::new(),
            deleted: false,
            delta: None,
        }
    }

    /// Appends a new delta at the chain head.
    pub fn push_delta(&mut self, commit_info: &Arc<CommitInfo>, action: DeltaAction) {
        let next = self.delta.take();
        self.delta = Some(Box::new(Delta::new(action, Arc::clone(commit_info), next)));
    }

    /// Applies one recorded inverse to the materialized fields.
    ///
    /// Panics on label or edge-link actions: those never belong to an edge
    /// chain, so finding one means the append-only invariant was violated.
    pub fn apply_action(&mut self, action: &DeltaAction) {
        match action {
            DeltaAction::SetProperty { key, value } => {
                if value.is_null() {
                    self.properties.remove(key);
                } else {
                    self.properties.insert(*key, value.clone());
                }
            }
            DeltaAction::RecreateObject => {
                self.deleted = false;
            }
            DeltaAction::DeleteObject => {
                self.deleted = true;
            }
            other => unreachable!("edge delta chain holds a vertex action: {other:?}"),
        }
    }

    /// Reconstructs the state visible to the given reader, or `None` when
    /// the edge does not exist in that snapshot.
    pub fn snapshot(
        &self,
        tx_id: TransactionId,
        start_logical: u64,
        view: View,
    ) -> Option<EdgeSnapshot> {
        let mut properties = self.properties.clone();
        let mut deleted = self.deleted;
        let mut cur = self.delta.as_deref();
        while let Some(delta) = cur {
            if stops_walk(&delta.commit_info, tx_id, start_logical, view) {
                break;
            }
            match &delta.action {
                DeltaAction::SetProperty { key, value } => {
                    if value.is_null() {
                        properties.remove(key);
                    } else {
                        properties.insert(*key, value.clone());
                    }
                }
                DeltaAction::RecreateObject => deleted = false,
                DeltaAction::DeleteObject => deleted = true,
                other => unreachable!("edge delta chain holds a vertex action: {other:?}"),
            }
            cur = delta.next.as_deref();
        }
        if deleted {
            return None;
        }
        Some(EdgeSnapshot {
            gid: self.gid,
            from: self.from.clone(),
            to: self.to.clone(),
            edge_type: self.edge_type,
            properties,
        })
    }
}

/// An immutable reconstruction of an edge as seen by one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSnapshot {
    /// Globally unique id.
    pub gid: Gid,
    /// Source endpoint.
    pub from: VertexId,
    /// Target endpoint.
    pub to: VertexId,
    /// Edge type.
    pub edge_type: EdgeTypeId,
    /// Properties in the snapshot.
    pub properties: BTreeMap<PropertyId, PropertyValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::{LabelId, PrimaryKey};

    fn endpoints() -> (VertexId, VertexId) {
        let label = LabelId::new(1);
        (
            VertexId::new(label, PrimaryKey(vec![PropertyValue::Int(1)])),
            VertexId::new(label, PrimaryKey(vec![PropertyValue::Int(2)])),
        )
    }

    #[test]
    fn test_uncommitted_edge_invisible_to_others() {
        let owner = TransactionId::new(5);
        let info = Arc::new(CommitInfo::uncommitted(owner));
        let (from, to) = endpoints();
        let mut edge = Edge::new(Gid::new(0), from, to, EdgeTypeId::new(3));
        edge.push_delta(&info, DeltaAction::DeleteObject);

        assert!(edge.snapshot(owner, 5, View::New).is_some());
        assert!(edge.snapshot(TransactionId::new(6), 6, View::Old).is_none());
    }

    #[test]
    fn test_deleted_edge_visible_to_old_snapshots() {
        let t1 = TransactionId::new(5);
        let info1 = Arc::new(CommitInfo::uncommitted(t1));
        let (from, to) = endpoints();
        let mut edge = Edge::new(Gid::new(0), from, to, EdgeTypeId::new(3));
        edge.push_delta(&info1, DeltaAction::DeleteObject);
        info1.publish(10);

        let t2 = TransactionId::new(15);
        let info2 = Arc::new(CommitInfo::uncommitted(t2));
        edge.deleted = true;
        edge.push_delta(&info2, DeltaAction::RecreateObject);
        info2.publish(20);

        assert!(edge.snapshot(TransactionId::new(12), 12, View::Old).is_some());
        assert!(edge.snapshot(TransactionId::new(25), 25, View::Old).is_none());
    }
}
