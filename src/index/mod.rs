//! Secondary indices over committed state.
//!
//! The label and label+property indices are derived, rebuildable
//! structures. Entries are inserted when a write materializes and removed
//! lazily by the garbage collector; a stale entry is harmless because every
//! index read resolves the vertex and re-checks visibility with the same
//! chain walk ordinary reads use. Counts taken from index metadata are
//! therefore always over-estimates, never under-estimates, which keeps
//! query planning conservative.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use crate::db::shard::Accessor;
use crate::storage::value::{LabelId, PrimaryKey, PropertyId, PropertyValue};
use crate::storage::vertex::VertexSnapshot;
use crate::storage::View;

/// Vertices by secondary label.
#[derive(Debug, Default)]
pub struct LabelIndex {
    registered: RwLock<BTreeSet<LabelId>>,
    entries: RwLock<BTreeMap<LabelId, BTreeSet<PrimaryKey>>>,
}

impl LabelIndex {
    /// Registers `label`. Returns `false` when already registered.
    pub fn register(&self, label: LabelId) -> bool {
        let newly = self.registered.write().insert(label);
        if newly {
            self.entries.write().entry(label).or_default();
        }
        newly
    }

    /// Unregisters `label` and drops its entries. Returns `false` when the
    /// index did not exist, which makes drops idempotent.
    pub fn unregister(&self, label: LabelId) -> bool {
        let existed = self.registered.write().remove(&label);
        if existed {
            self.entries.write().remove(&label);
        }
        existed
    }

    /// True when `label` is indexed.
    pub fn is_registered(&self, label: LabelId) -> bool {
        self.registered.read().contains(&label)
    }

    /// All registered labels.
    pub fn list(&self) -> Vec<LabelId> {
        self.registered.read().iter().copied().collect()
    }

    /// Inserts an entry when the label is indexed.
    pub fn insert(&self, label: LabelId, key: PrimaryKey) {
        if !self.is_registered(label) {
            return;
        }
        self.entries.write().entry(label).or_default().insert(key);
    }

    /// Candidate keys for `label`, unfiltered by visibility.
    pub fn keys(&self, label: LabelId) -> Vec<PrimaryKey> {
        self.entries
            .read()
            .get(&label)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of entries for `label`; an over-estimate of the live count.
    pub fn approximate_count(&self, label: LabelId) -> Option<u64> {
        if !self.is_registered(label) {
            return None;
        }
        Some(
            self.entries
                .read()
                .get(&label)
                .map(|set| set.len() as u64)
                .unwrap_or(0),
        )
    }

    /// Drops every entry pointing at one of `keys` (vertices the garbage
    /// collector unlinked).
    pub fn purge_keys(&self, keys: &BTreeSet<PrimaryKey>) {
        if keys.is_empty() {
            return;
        }
        for set in self.entries.write().values_mut() {
            set.retain(|key| !keys.contains(key));
        }
    }
}

/// Vertices by secondary label plus property value.
#[derive(Debug, Default)]
pub struct LabelPropertyIndex {
    registered: RwLock<BTreeSet<(LabelId, PropertyId)>>,
    entries: RwLock<BTreeMap<(LabelId, PropertyId), BTreeSet<(PropertyValue, PrimaryKey)>>>,
}

impl LabelPropertyIndex {
    /// Registers the pair. Returns `false` when already registered.
    pub fn register(&self, label: LabelId, property: PropertyId) -> bool {
        let newly = self.registered.write().insert((label, property));
        if newly {
            self.entries.write().entry((label, property)).or_default();
        }
        newly
    }

    /// Unregisters the pair and drops its entries. Idempotent.
    pub fn unregister(&self, label: LabelId, property: PropertyId) -> bool {
        let existed = self.registered.write().remove(&(label, property));
        if existed {
            self.entries.write().remove(&(label, property));
        }
        existed
    }

    /// True when the pair is indexed.
    pub fn is_registered(&self, label: LabelId, property: PropertyId) -> bool {
        self.registered.read().contains(&(label, property))
    }

    /// All registered pairs.
    pub fn list(&self) -> Vec<(LabelId, PropertyId)> {
        self.registered.read().iter().copied().collect()
    }

    /// Inserts an entry when the pair is indexed.
    pub fn insert(&self, label: LabelId, property: PropertyId, value: PropertyValue, key: PrimaryKey) {
        if !self.is_registered(label, property) {
            return;
        }
        self.entries
            .write()
            .entry((label, property))
            .or_default()
            .insert((value, key));
    }

    /// Candidate keys for the pair, optionally narrowed to one value,
    /// unfiltered by visibility.
    pub fn keys(
        &self,
        label: LabelId,
        property: PropertyId,
        value: Option<&PropertyValue>,
    ) -> Vec<PrimaryKey> {
        let entries = self.entries.read();
        let Some(set) = entries.get(&(label, property)) else {
            return Vec::new();
        };
        set.iter()
            .filter(|(v, _)| value.map_or(true, |want| v == want))
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Number of entries for the pair; an over-estimate of the live count.
    pub fn approximate_count(
        &self,
        label: LabelId,
        property: PropertyId,
        value: Option<&PropertyValue>,
    ) -> Option<u64> {
        if !self.is_registered(label, property) {
            return None;
        }
        let entries = self.entries.read();
        let set = entries.get(&(label, property));
        Some(match (set, value) {
            (None, _) => 0,
            (Some(set), None) => set.len() as u64,
            (Some(set), Some(want)) => set.iter().filter(|(v, _)| v == want).count() as u64,
        })
    }

    /// Drops every entry pointing at one of `keys`.
    pub fn purge_keys(&self, keys: &BTreeSet<PrimaryKey>) {
        if keys.is_empty() {
            return;
        }
        for set in self.entries.write().values_mut() {
            set.retain(|(_, key)| !keys.contains(key));
        }
    }
}

/// All secondary structures of a shard.
#[derive(Debug, Default)]
pub struct Indices {
    /// By-label index.
    pub label: LabelIndex,
    /// By-label-and-property index.
    pub label_property: LabelPropertyIndex,
}

/// Which of the three iteration strategies a vertex scan uses. Dispatched
/// once per `next` call.
#[derive(Debug, Clone)]
pub(crate) enum IterStrategy {
    /// Every vertex in the container.
    All,
    /// Candidates from the label index.
    ByLabel(LabelId),
    /// Candidates from the label+property index, optionally pinned to a
    /// value.
    ByLabelProperty(LabelId, PropertyId, Option<PropertyValue>),
}

/// Iterator over the vertices visible to one accessor.
///
/// Candidate keys are captured up front from the container or an index
/// under a short lock; each `next` call then resolves the key and filters
/// it through the accessor's snapshot walk, so results honor the same
/// visibility rule as point reads.
pub struct VerticesIterator<'a, 's> {
    accessor: &'a Accessor<'s>,
    view: View,
    keys: std::vec::IntoIter<PrimaryKey>,
    strategy: IterStrategy,
}

impl<'a, 's> VerticesIterator<'a, 's> {
    pub(crate) fn new(
        accessor: &'a Accessor<'s>,
        view: View,
        keys: Vec<PrimaryKey>,
        strategy: IterStrategy,
    ) -> Self {
        Self {
            accessor,
            view,
            keys: keys.into_iter(),
            strategy,
        }
    }

    fn admits(&self, snapshot: &VertexSnapshot) -> bool {
        match &self.strategy {
            IterStrategy::All => true,
            IterStrategy::ByLabel(label) => snapshot.has_label(*label),
            IterStrategy::ByLabelProperty(label, property, value) => {
                snapshot.has_label(*label)
                    && match (snapshot.properties.get(property), value) {
                        (Some(_), None) => true,
                        (Some(have), Some(want)) => have == want,
                        (None, _) => false,
                    }
            }
        }
    }
}

impl Iterator for VerticesIterator<'_, '_> {
    type Item = VertexSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.keys.next()?;
            let Ok(snapshot) = self.accessor.find_vertex(&key, self.view) else {
                continue;
            };
            if self.admits(&snapshot) {
                return Some(snapshot);
            }
        }
    }
}
