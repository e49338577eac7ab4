//! Undo-log deltas and snapshot visibility.
//!
//! Every mutation appends a [`Delta`] to the head of the touched object's
//! chain. The delta records the *inverse* of the change (e.g. a property
//! write stores the old value) while the object's plain fields are updated
//! in place to the new state. Readers that need an older snapshot walk the
//! chain newest-to-oldest, applying each delta's inverse, until they reach
//! the first delta that is already visible to them.
//!
//! A chain is append-only at the head. Once linked a delta is immutable
//! except for its [`CommitInfo`] cell, which is shared by every delta of
//! one transaction and transitions exactly once, from "uncommitted, owned
//! by transaction T" to "committed at timestamp C". That single release
//! store is what makes a whole transaction's writes visible atomically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::transaction::TransactionId;
use crate::error::{Result, ShardError};
use crate::storage::value::{EdgeTypeId, Gid, LabelId, PropertyId, PropertyValue};
use crate::storage::vertex::VertexId;
use crate::storage::View;

/// Tag bit marking a [`CommitInfo`] as uncommitted. The low bits then hold
/// the owning transaction's start logical id. Logical clock values never
/// reach this bit.
pub(crate) const UNCOMMITTED_TAG: u64 = 1 << 63;

/// The shared commit-timestamp cell of one transaction.
///
/// Read concurrently by every snapshot walk with acquire ordering; written
/// once at commit with release ordering. This is the only mutable state on
/// a linked delta.
#[derive(Debug)]
pub struct CommitInfo {
    state: AtomicU64,
}

/// Decoded state of a [`CommitInfo`] cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// Still owned by the transaction; invisible to every other reader.
    Uncommitted(TransactionId),
    /// Committed at the given logical timestamp.
    Committed(u64),
}

impl CommitInfo {
    /// Creates a cell owned by `owner`, uncommitted.
    pub fn uncommitted(owner: TransactionId) -> Self {
        debug_assert!(owner.logical() < UNCOMMITTED_TAG);
        Self {
            state: AtomicU64::new(UNCOMMITTED_TAG | owner.logical()),
        }
    }

    /// Loads the current state with acquire ordering.
    pub fn state(&self) -> CommitState {
        let raw = self.state.load(Ordering::Acquire);
        if raw & UNCOMMITTED_TAG != 0 {
            CommitState::Uncommitted(TransactionId::new(raw & !UNCOMMITTED_TAG))
        } else {
            CommitState::Committed(raw)
        }
    }

    /// Publishes the commit timestamp. Idempotent for the same timestamp so
    /// a transaction duplicated across split shards can be finalized through
    /// either copy.
    pub fn publish(&self, commit_logical: u64) {
        debug_assert!(commit_logical < UNCOMMITTED_TAG, "logical clock overflow");
        self.state.store(commit_logical, Ordering::Release);
    }
}

/// A reference to one incident edge as stored on a vertex: the edge type,
/// the far endpoint and the globally unique edge id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeLink {
    /// Type of the edge.
    pub edge_type: EdgeTypeId,
    /// The endpoint on the other side, which may live on another shard.
    pub vertex: VertexId,
    /// Globally unique edge id.
    pub gid: Gid,
}

/// The inverse operation recorded by a delta.
#[derive(Debug, Clone)]
pub enum DeltaAction {
    /// Re-add a removed label.
    AddLabel(LabelId),
    /// Remove an added label.
    RemoveLabel(LabelId),
    /// Restore a property to its previous value (`Null` erases it).
    SetProperty {
        /// Property key.
        key: PropertyId,
        /// Previous value.
        value: PropertyValue,
    },
    /// Re-link a removed in-edge.
    AddInEdge(EdgeLink),
    /// Re-link a removed out-edge.
    AddOutEdge(EdgeLink),
    /// Unlink an added in-edge.
    RemoveInEdge(EdgeLink),
    /// Unlink an added out-edge.
    RemoveOutEdge(EdgeLink),
    /// Undo a deletion: the object existed before.
    RecreateObject,
    /// Undo a creation: the object did not exist before.
    DeleteObject,
}

/// A single undo-log entry.
///
/// The chain is singly owned backwards: the object's head owns the newest
/// delta, each delta owns the next-older one. The owning object is not
/// referenced from the delta; the transaction's write set serves as the
/// (weak) back-reference used during abort unwind.
#[derive(Debug, Clone)]
pub struct Delta {
    /// The recorded inverse operation.
    pub action: DeltaAction,
    /// Commit cell shared with the creating transaction.
    pub commit_info: Arc<CommitInfo>,
    /// Next-older delta in the chain.
    pub next: Option<Box<Delta>>,
}

impl Delta {
    /// Creates a delta sharing the transaction's commit cell.
    pub fn new(action: DeltaAction, commit_info: Arc<CommitInfo>, next: Option<Box<Delta>>) -> Self {
        Self {
            action,
            commit_info,
            next,
        }
    }
}

/// Decides whether a snapshot walk stops at this delta, i.e. whether the
/// state reconstructed so far is the one visible to the reader.
///
/// A reader with start timestamp `start_logical` in transaction `tx_id`
/// stops at the first delta that is either committed at or before its start
/// or (under [`View::New`]) owned by its own transaction. Every delta above
/// the stop point has its inverse applied, which removes concurrent
/// uncommitted work and later commits from the reconstructed state.
pub(crate) fn stops_walk(
    info: &CommitInfo,
    tx_id: TransactionId,
    start_logical: u64,
    view: View,
) -> bool {
    match info.state() {
        CommitState::Uncommitted(owner) => view == View::New && owner == tx_id,
        CommitState::Committed(ts) => ts <= start_logical,
    }
}

/// Guards a chain-head append: writing on top of another live transaction's
/// delta, or on top of a commit newer than the writer's snapshot, is a
/// write-write conflict and fails with `Serialization`. This keeps one
/// transaction's undo values from ever capturing another live transaction's
/// uncommitted state, so abort unwind stays local to the aborting
/// transaction.
pub(crate) fn prepare_for_write(
    head: Option<&Delta>,
    tx_id: TransactionId,
    start_logical: u64,
) -> Result<()> {
    match head {
        None => Ok(()),
        Some(delta) => match delta.commit_info.state() {
            CommitState::Uncommitted(owner) if owner == tx_id => Ok(()),
            CommitState::Uncommitted(_) => Err(ShardError::Serialization),
            CommitState::Committed(ts) if ts <= start_logical => Ok(()),
            CommitState::Committed(_) => Err(ShardError::Serialization),
        },
    }
}
