//! Per-transaction state.
//!
//! A [`Transaction`] is created when an accessor opens and lives in the
//! shard's transaction table until the garbage collector proves that no
//! other transaction can still reference its deltas. Its identity is the
//! logical component of its start timestamp, which the shard clock keeps
//! unique and monotonic.
//!
//! The transaction does not own its deltas; delta chains are owned by the
//! objects they describe. Instead it records a write set of the objects it
//! touched; abort unwind and commit validation resolve the set against the
//! containers, which is the non-owning back-reference from deltas to
//! objects.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::db::hlc::Hlc;
use crate::db::wal::WalPayload;
use crate::storage::delta::CommitInfo;
use crate::storage::value::{Gid, PrimaryKey};

/// Transaction identity: the logical component of the start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Wraps a start-timestamp logical value.
    pub const fn new(logical: u64) -> Self {
        Self(logical)
    }

    /// The start-timestamp logical value.
    pub const fn logical(self) -> u64 {
        self.0
    }
}

/// Isolation level of a transaction. The engine provides snapshot isolation
/// only; the variant exists so the level travels with the transaction (it
/// is copied, not re-derived, when a shard splits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Each read observes a consistent snapshot as of the start timestamp.
    #[default]
    SnapshotIsolation,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting operations.
    Active,
    /// Commit timestamp published.
    Committed,
    /// Unwound; its deltas are unlinked.
    Aborted,
}

/// One entry of a transaction's write set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum WriteTarget {
    /// A vertex, by primary key.
    Vertex(PrimaryKey),
    /// An edge, by global id.
    Edge(Gid),
}

/// Mutable per-transaction state shared between the accessor, the shard's
/// transaction table and (after a split) every descendant shard.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    start_timestamp: Hlc,
    isolation_level: IsolationLevel,
    commit_info: Arc<CommitInfo>,
    state: Mutex<TransactionState>,
    commit_timestamp: Mutex<Option<Hlc>>,
    write_set: Mutex<BTreeSet<WriteTarget>>,
    wal_buffer: Mutex<Vec<WalPayload>>,
}

impl Transaction {
    /// Creates an active transaction starting at `start_timestamp`.
    pub fn new(start_timestamp: Hlc, isolation_level: IsolationLevel) -> Self {
        let id = TransactionId::new(start_timestamp.logical);
        Self {
            id,
            start_timestamp,
            isolation_level,
            commit_info: Arc::new(CommitInfo::uncommitted(id)),
            state: Mutex::new(TransactionState::Active),
            commit_timestamp: Mutex::new(None),
            write_set: Mutex::new(BTreeSet::new()),
            wal_buffer: Mutex::new(Vec::new()),
        }
    }

    /// The transaction id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The start timestamp.
    pub fn start_timestamp(&self) -> Hlc {
        self.start_timestamp
    }

    /// The isolation level.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// The commit cell shared by all of this transaction's deltas.
    pub fn commit_info(&self) -> &Arc<CommitInfo> {
        &self.commit_info
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// True while the transaction accepts operations.
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// The commit timestamp, once committed.
    pub fn commit_timestamp(&self) -> Option<Hlc> {
        *self.commit_timestamp.lock()
    }

    pub(crate) fn record_write(&self, target: WriteTarget) {
        self.write_set.lock().insert(target);
    }

    pub(crate) fn write_targets(&self) -> Vec<WriteTarget> {
        self.write_set.lock().iter().cloned().collect()
    }

    pub(crate) fn record_wal(&self, payload: WalPayload) {
        self.wal_buffer.lock().push(payload);
    }

    pub(crate) fn take_wal(&self) -> Vec<WalPayload> {
        std::mem::take(&mut *self.wal_buffer.lock())
    }

    pub(crate) fn mark_committed(&self, commit_timestamp: Hlc) {
        *self.commit_timestamp.lock() = Some(commit_timestamp);
        *self.state.lock() = TransactionState::Committed;
    }

    pub(crate) fn mark_aborted(&self) {
        *self.state.lock() = TransactionState::Aborted;
    }

    /// Copies the transaction for a split shard. Timestamp, isolation level,
    /// state and write set are copied; the commit cell is shared, so a later
    /// commit or abort against the transaction id finalizes the deltas held
    /// by every descendant shard at once.
    pub(crate) fn duplicate_for_split(&self) -> Transaction {
        Transaction {
            id: self.id,
            start_timestamp: self.start_timestamp,
            isolation_level: self.isolation_level,
            commit_info: Arc::clone(&self.commit_info),
            state: Mutex::new(self.state()),
            commit_timestamp: Mutex::new(self.commit_timestamp()),
            write_set: Mutex::new(self.write_set.lock().clone()),
            wal_buffer: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::delta::CommitState;

    #[test]
    fn test_lifecycle() {
        let tx = Transaction::new(Hlc::from_logical(5), IsolationLevel::SnapshotIsolation);
        assert!(tx.is_active());
        assert_eq!(tx.id(), TransactionId::new(5));
        assert_eq!(
            tx.commit_info().state(),
            CommitState::Uncommitted(TransactionId::new(5))
        );

        tx.commit_info().publish(9);
        tx.mark_committed(Hlc::from_logical(9));
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(tx.commit_timestamp().map(|h| h.logical), Some(9));
    }

    #[test]
    fn test_split_duplicate_shares_commit_cell() {
        let tx = Transaction::new(Hlc::from_logical(5), IsolationLevel::SnapshotIsolation);
        tx.record_write(WriteTarget::Edge(Gid::new(3)));
        let copy = tx.duplicate_for_split();
        assert_eq!(copy.write_targets(), tx.write_targets());

        tx.commit_info().publish(8);
        assert_eq!(copy.commit_info().state(), CommitState::Committed(8));
    }
}
