//! Garbage collection for delta chains and logically deleted objects.
//!
//! A GC cycle computes the snapshot boundary (the minimum start timestamp
//! among live transactions, or +∞ when none are live) and then:
//!
//! 1. trims every chain from its oldest end: walking from the head, the
//!    first delta committed at or before the boundary is the stop point for
//!    every snapshot the boundary protects, so it and everything older is
//!    unlinked in one cut (never from the middle);
//! 2. unlinks objects whose deletion has become visible to every possible
//!    future reader;
//! 3. drops transaction-table entries no live snapshot can reference.
//!
//! Nothing is freed synchronously. Unlinked chains and objects are staged
//! into deferred queues keyed by the epoch at which they were unlinked, and
//! physically dropped only once every reader epoch announced before the
//! unlink has been retired ([`EpochRegistry`]). Accessors pin an epoch for
//! their lifetime, so an in-flight chain traversal always outlives the
//! memory it walks.
//!
//! The collector holds no lock across a whole container sweep: it snapshots
//! the entry list under a short container lock and then trims one chain at
//! a time under that object's own lock.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::db::config::GcConfig;
use crate::db::shard::Shard;
use crate::db::transaction::TransactionState;
use crate::storage::delta::{CommitState, Delta};
use crate::storage::value::PrimaryKey;

/// Statistics collected during one GC cycle.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Delta chains examined.
    pub chains_scanned: usize,
    /// Deltas unlinked from chains.
    pub deltas_reclaimed: usize,
    /// Vertices unlinked from the container.
    pub vertices_unlinked: usize,
    /// Edges unlinked from the container.
    pub edges_unlinked: usize,
    /// Transaction-table entries dropped.
    pub transactions_cleaned: usize,
    /// Staged items whose memory was returned this cycle.
    pub objects_freed: usize,
    /// The snapshot boundary used (`u64::MAX` when no transaction was
    /// live).
    pub watermark_logical: u64,
    /// Cycle duration in milliseconds.
    pub duration_ms: u64,
}

impl GcStats {
    /// True when the cycle reclaimed anything.
    pub fn any_reclaimed(&self) -> bool {
        self.deltas_reclaimed > 0 || self.vertices_unlinked > 0 || self.edges_unlinked > 0
    }
}

/// Reader-epoch registry backing the deferred-free queues.
///
/// Readers announce themselves by pinning the current epoch; the collector
/// advances the epoch when it unlinks memory. Staged memory is freed only
/// when strictly older than every pinned epoch.
#[derive(Debug)]
pub struct EpochRegistry {
    global: AtomicU64,
    readers: Mutex<BTreeMap<u64, usize>>,
}

impl EpochRegistry {
    /// Creates a registry at epoch zero.
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(0),
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Announces a reader at the current epoch.
    pub fn pin(&self) -> EpochGuard<'_> {
        let epoch = self.global.load(Ordering::Acquire);
        *self.readers.lock().entry(epoch).or_insert(0) += 1;
        EpochGuard {
            registry: self,
            epoch,
        }
    }

    /// Advances the global epoch, returning the new value. Called once per
    /// GC cycle before unlinking.
    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The oldest epoch still announced by a reader.
    pub fn oldest_pinned(&self) -> Option<u64> {
        self.readers.lock().keys().next().copied()
    }

    /// The current global epoch.
    pub fn current(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }
}

impl Default for EpochRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Unpins its epoch on drop.
#[derive(Debug)]
pub struct EpochGuard<'a> {
    registry: &'a EpochRegistry,
    epoch: u64,
}

impl EpochGuard<'_> {
    /// The epoch announced by this guard.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        let mut readers = self.registry.readers.lock();
        if let Some(count) = readers.get_mut(&self.epoch) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&self.epoch);
            }
        }
    }
}

/// A deferred-free queue: unlinked items wait here, keyed by the epoch at
/// which they were unlinked, until no announced reader epoch precedes that
/// staging epoch.
#[derive(Debug)]
pub struct DeferredDeleter<T> {
    staged: Mutex<VecDeque<(u64, T)>>,
}

impl<T> DeferredDeleter<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            staged: Mutex::new(VecDeque::new()),
        }
    }

    /// Stages an unlinked item at `epoch`.
    pub fn stage(&self, epoch: u64, item: T) {
        let mut staged = self.staged.lock();
        debug_assert!(staged.back().map_or(true, |(e, _)| *e <= epoch));
        staged.push_back((epoch, item));
    }

    /// Drops every item staged strictly before `before_epoch`, returning
    /// how many were freed.
    pub fn free_expired(&self, before_epoch: u64) -> usize {
        let mut staged = self.staged.lock();
        let mut freed = 0;
        while staged.front().is_some_and(|(epoch, _)| *epoch < before_epoch) {
            staged.pop_front();
            freed += 1;
        }
        freed
    }

    /// Number of items awaiting quiescence.
    pub fn count(&self) -> usize {
        self.staged.lock().len()
    }
}

impl<T> Default for DeferredDeleter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cuts the reclaimable suffix off a chain: from the first delta (counting
/// from the head) committed at or before `watermark`, inclusive, downward.
/// Every snapshot the watermark protects stops its walk at or above the cut
/// without applying the cut deltas, so reconstruction is unchanged.
fn cut_reclaimable(head: &mut Option<Box<Delta>>, watermark: u64) -> Option<Box<Delta>> {
    let mut cur = head;
    loop {
        let should_cut = match &*cur {
            None => return None,
            Some(delta) => {
                matches!(delta.commit_info.state(), CommitState::Committed(ts) if ts <= watermark)
            }
        };
        if should_cut {
            return cur.take();
        }
        match cur {
            Some(delta) => cur = &mut delta.next,
            None => return None,
        }
    }
}

fn chain_len(mut chain: Option<&Delta>) -> usize {
    let mut len = 0;
    while let Some(delta) = chain {
        len += 1;
        chain = delta.next.as_deref();
    }
    len
}

impl Shard {
    /// Runs one garbage-collection cycle. Safe to call concurrently with
    /// live accessors; may invalidate nothing they can still observe.
    pub fn collect_garbage(&self) -> GcStats {
        let started = Instant::now();
        let watermark = {
            let transactions = self.transactions.lock();
            transactions
                .values()
                .filter(|tx| tx.state() == TransactionState::Active)
                .map(|tx| tx.id().logical())
                .min()
                .unwrap_or(u64::MAX)
        };
        let staging_epoch = self.epochs.advance();
        let mut stats = GcStats {
            watermark_logical: watermark,
            ..GcStats::default()
        };

        // Phase 1: trim chains, one object lock at a time.
        let vertex_entries: Vec<_> = self
            .vertices
            .read()
            .values()
            .map(Arc::clone)
            .collect();
        for arc in &vertex_entries {
            let mut vertex = arc.write();
            stats.chains_scanned += 1;
            if let Some(cut) = cut_reclaimable(&mut vertex.delta, watermark) {
                stats.deltas_reclaimed += chain_len(Some(&cut));
                self.deferred_deltas.stage(staging_epoch, cut);
            }
        }
        let edge_entries: Vec<_> = self
            .edges
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for arc in &edge_entries {
            let mut edge = arc.write();
            stats.chains_scanned += 1;
            if let Some(cut) = cut_reclaimable(&mut edge.delta, watermark) {
                stats.deltas_reclaimed += chain_len(Some(&cut));
                self.deferred_deltas.stage(staging_epoch, cut);
            }
        }

        // Phase 2: unlink objects whose deletion is visible to every
        // possible snapshot. After phase 1 that is exactly "deleted with an
        // empty chain": a deletion at or below the watermark had its whole
        // chain cut; anything newer still carries deltas.
        let mut unlinked_keys = BTreeSet::new();
        let pending_vertices: Vec<PrimaryKey> =
            std::mem::take(&mut *self.deleted_vertices.lock());
        let mut requeue_vertices = Vec::new();
        for key in pending_vertices {
            // Verify under the container lock: the vertex may have been
            // recreated (or already unlinked) since it was queued.
            let mut container = self.vertices.write();
            let state = container.get(&key).map(|arc| {
                let vertex = arc.read();
                (vertex.deleted, vertex.delta.is_none())
            });
            match state {
                None | Some((false, _)) => {}
                Some((true, true)) => {
                    if let Some(removed) = container.remove(&key) {
                        drop(container);
                        self.deferred_vertices
                            .stage(staging_epoch, (key.clone(), removed));
                        unlinked_keys.insert(key);
                        stats.vertices_unlinked += 1;
                    }
                }
                Some((true, false)) => {
                    drop(container);
                    requeue_vertices.push(key);
                }
            }
        }
        self.deleted_vertices.lock().extend(requeue_vertices);

        let pending_edges: Vec<_> = std::mem::take(&mut *self.deleted_edges.lock());
        let mut requeue_edges = Vec::new();
        for gid in pending_edges {
            let mut keep = false;
            let removed = self.edges.remove_if(&gid, |_, arc| {
                let edge = arc.read();
                let removable = edge.deleted && edge.delta.is_none();
                if edge.deleted && !removable {
                    keep = true;
                }
                removable
            });
            if let Some((_, removed)) = removed {
                self.deferred_edges.stage(staging_epoch, (gid, removed));
                stats.edges_unlinked += 1;
            } else if keep {
                requeue_edges.push(gid);
            }
        }
        self.deleted_edges.lock().extend(requeue_edges);

        self.indices.label.purge_keys(&unlinked_keys);
        self.indices.label_property.purge_keys(&unlinked_keys);

        // Phase 3: drop transaction-table entries below the boundary.
        {
            let mut transactions = self.transactions.lock();
            let before = transactions.len();
            transactions.retain(|_, tx| match tx.state() {
                TransactionState::Active => true,
                TransactionState::Aborted => false,
                TransactionState::Committed => tx
                    .commit_timestamp()
                    .map_or(true, |commit| commit.logical >= watermark),
            });
            stats.transactions_cleaned = before - transactions.len();
        }

        // Phase 4: free staged memory that no announced reader predates.
        let min_live_epoch = self.epochs.oldest_pinned().unwrap_or(u64::MAX);
        stats.objects_freed = self.deferred_vertices.free_expired(min_live_epoch)
            + self.deferred_edges.free_expired(min_live_epoch)
            + self.deferred_deltas.free_expired(min_live_epoch);

        stats.duration_ms = started.elapsed().as_millis() as u64;
        if stats.any_reclaimed() {
            info!(
                watermark = stats.watermark_logical,
                deltas = stats.deltas_reclaimed,
                vertices = stats.vertices_unlinked,
                edges = stats.edges_unlinked,
                freed = stats.objects_freed,
                duration_ms = stats.duration_ms,
                "gc cycle completed"
            );
        } else {
            debug!(
                watermark = stats.watermark_logical,
                chains = stats.chains_scanned,
                "gc cycle found nothing to reclaim"
            );
        }
        stats
    }
}

/// Messages understood by the background GC thread.
#[derive(Debug)]
enum GcMessage {
    Trigger,
    Shutdown,
}

/// Handle to a background thread running periodic GC cycles against one
/// shard.
pub struct BackgroundGc {
    sender: Option<mpsc::Sender<GcMessage>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl BackgroundGc {
    /// Spawns the background thread. When GC is disabled in the config the
    /// returned handle is inert.
    pub fn spawn(shard: Arc<Shard>, config: GcConfig) -> Self {
        if !config.enabled {
            return Self {
                sender: None,
                handle: None,
            };
        }
        let (sender, receiver) = mpsc::channel();
        let interval = config.interval;
        let handle = thread::spawn(move || loop {
            match receiver.recv_timeout(interval) {
                Ok(GcMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                    shard.collect_garbage();
                }
                Ok(GcMessage::Shutdown) => {
                    info!("background gc shutting down");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("background gc channel disconnected");
                    break;
                }
            }
        });
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Requests an immediate GC cycle.
    pub fn trigger(&self) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(GcMessage::Trigger);
        }
    }

    /// Stops the background thread and waits for it to exit.
    pub fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(GcMessage::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundGc {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::transaction::TransactionId;
    use crate::storage::delta::{CommitInfo, DeltaAction};

    fn committed_delta(ts: u64, next: Option<Box<Delta>>) -> Box<Delta> {
        let info = Arc::new(CommitInfo::uncommitted(TransactionId::new(1)));
        info.publish(ts);
        Box::new(Delta::new(DeltaAction::RecreateObject, info, next))
    }

    #[test]
    fn test_cut_keeps_deltas_above_watermark() {
        // head: ts=30 -> ts=20 -> ts=10, watermark 15
        let mut head = Some(committed_delta(
            30,
            Some(committed_delta(20, Some(committed_delta(10, None)))),
        ));
        let cut = cut_reclaimable(&mut head, 15).expect("suffix reclaimable");
        assert_eq!(chain_len(Some(&cut)), 1); // only ts=10 is below the boundary
        assert_eq!(chain_len(head.as_deref()), 2); // ts=30 and ts=20 survive
    }

    #[test]
    fn test_cut_drops_whole_stable_chain() {
        let mut head = Some(committed_delta(5, Some(committed_delta(3, None))));
        let cut = cut_reclaimable(&mut head, 10).expect("whole chain reclaimable");
        assert_eq!(chain_len(Some(&cut)), 2);
        assert!(head.is_none());
    }

    #[test]
    fn test_cut_spares_uncommitted_chain() {
        let info = Arc::new(CommitInfo::uncommitted(TransactionId::new(9)));
        let mut head = Some(Box::new(Delta::new(DeltaAction::RecreateObject, info, None)));
        assert!(cut_reclaimable(&mut head, u64::MAX).is_none());
        assert!(head.is_some());
    }

    #[test]
    fn test_deferred_deleter_frees_strictly_older() {
        let deleter = DeferredDeleter::new();
        deleter.stage(5, "a");
        deleter.stage(5, "b");
        assert_eq!(deleter.count(), 2);
        assert_eq!(deleter.free_expired(5), 0);
        assert_eq!(deleter.count(), 2);
        assert_eq!(deleter.free_expired(6), 2);
        assert_eq!(deleter.count(), 0);
    }

    #[test]
    fn test_epoch_registry_tracks_oldest_reader() {
        let registry = EpochRegistry::new();
        assert_eq!(registry.oldest_pinned(), None);
        let guard_a = registry.pin();
        registry.advance();
        let guard_b = registry.pin();
        assert_eq!(registry.oldest_pinned(), Some(guard_a.epoch()));
        drop(guard_a);
        assert_eq!(registry.oldest_pinned(), Some(guard_b.epoch()));
        drop(guard_b);
        assert_eq!(registry.oldest_pinned(), None);
    }
}
