//! The shard: containers, transaction table and the transactional accessor.
//!
//! A shard owns a contiguous primary-key range `[min, max)` of one primary
//! label, the vertex and edge containers for that range, the secondary
//! indices, the schema registry and the live-transaction table. All reads
//! and writes go through an [`Accessor`] opened with [`Shard::access`];
//! commit, abort, garbage collection and splitting are the only operations
//! that touch cross-object shared state, and they hold only short, bounded
//! critical sections.
//!
//! Commit timestamps are supplied by the caller (normally the cluster's
//! ordering/replication collaborator) and are assumed monotonic per shard;
//! the shard folds them into its clock but does not enforce global order.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::db::config::Config;
use crate::db::gc::{DeferredDeleter, EpochGuard, EpochRegistry};
use crate::db::hlc::{Hlc, HlcClock};
use crate::db::transaction::{
    IsolationLevel, Transaction, TransactionId, WriteTarget,
};
use crate::db::wal::{WalPayload, WalRecord, WalSink};
use crate::error::{Result, ShardError};
use crate::index::{Indices, IterStrategy, VerticesIterator};
use crate::storage::delta::{prepare_for_write, CommitState, Delta, DeltaAction, EdgeLink};
use crate::storage::edge::{Edge, EdgeSnapshot};
use crate::storage::schema::{validate_primary_key, SchemaProperty, Schemas};
use crate::storage::value::{EdgeTypeId, Gid, LabelId, PrimaryKey, PropertyId, PropertyValue};
use crate::storage::vertex::{Vertex, VertexId, VertexSnapshot};
use crate::storage::View;

/// Bidirectional mapping between raw ids and human-readable names for
/// labels, properties and edge types. Ids are assigned by the cluster; the
/// shard only stores the mapping.
#[derive(Debug, Default)]
struct NameMapping {
    id_to_name: HashMap<u64, String>,
    name_to_id: HashMap<String, u64>,
}

/// Existing indices, as reported to the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicesInfo {
    /// Registered label indices.
    pub label: Vec<LabelId>,
    /// Registered label+property indices.
    pub label_property: Vec<(LabelId, PropertyId)>,
}

/// Coarse storage statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageInfo {
    /// Vertices resident in the container, including logically deleted ones
    /// awaiting garbage collection.
    pub vertex_count: u64,
    /// Edges resident in the container.
    pub edge_count: u64,
    /// Average incident edges per vertex.
    pub average_degree: f64,
}

/// Emitted when a shard considers itself oversized; the shard map
/// collaborator decides whether to act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedSplitInfo {
    /// Primary label of the shard.
    pub primary_label: LabelId,
    /// Version of the shard making the suggestion.
    pub shard_version: Hlc,
    /// The shard's low key.
    pub low_key: PrimaryKey,
    /// Suggested split boundary (the median resident key).
    pub split_key: PrimaryKey,
}

/// A node-local partition owning a contiguous primary-key range.
pub struct Shard {
    pub(crate) primary_label: LabelId,
    pub(crate) min_primary_key: PrimaryKey,
    pub(crate) max_primary_key: Option<PrimaryKey>,
    shard_version: Hlc,
    pub(crate) clock: HlcClock,
    pub(crate) vertices: RwLock<BTreeMap<PrimaryKey, Arc<RwLock<Vertex>>>>,
    pub(crate) edges: DashMap<Gid, Arc<RwLock<Edge>>>,
    pub(crate) schemas: Schemas,
    pub(crate) indices: Indices,
    name_mapping: RwLock<NameMapping>,
    /// Every transaction that read or wrote this shard and has not been
    /// cleaned up yet, keyed by start logical id.
    pub(crate) transactions: Mutex<BTreeMap<u64, Arc<Transaction>>>,
    /// Serializes commit validation and publication.
    commit_lock: Mutex<()>,
    /// Logically deleted vertices pending garbage collection.
    pub(crate) deleted_vertices: Mutex<Vec<PrimaryKey>>,
    /// Logically deleted edges pending garbage collection.
    pub(crate) deleted_edges: Mutex<Vec<Gid>>,
    pub(crate) epochs: EpochRegistry,
    pub(crate) deferred_vertices: DeferredDeleter<(PrimaryKey, Arc<RwLock<Vertex>>)>,
    pub(crate) deferred_edges: DeferredDeleter<(Gid, Arc<RwLock<Edge>>)>,
    pub(crate) deferred_deltas: DeferredDeleter<Box<Delta>>,
    pub(crate) config: Config,
    isolation_level: Mutex<IsolationLevel>,
    wal: RwLock<Option<Arc<dyn WalSink>>>,
}

impl Shard {
    /// Creates an empty shard owning `[min_primary_key, max_primary_key)`
    /// of `primary_label`, with the given primary-key schema.
    pub fn new(
        primary_label: LabelId,
        min_primary_key: PrimaryKey,
        max_primary_key: Option<PrimaryKey>,
        schema: Vec<SchemaProperty>,
        shard_version: Hlc,
        config: Config,
        id_to_name: HashMap<u64, String>,
    ) -> Result<Self> {
        if schema.is_empty() {
            return Err(ShardError::SchemaViolation(
                "primary-key schema must not be empty".into(),
            ));
        }
        if let Some(max) = &max_primary_key {
            if *max <= min_primary_key {
                return Err(ShardError::Config(
                    "max_primary_key must be greater than min_primary_key".into(),
                ));
            }
        }
        let schemas = Schemas::new();
        schemas.create_schema(primary_label, schema);
        let shard = Self {
            primary_label,
            min_primary_key,
            max_primary_key,
            shard_version,
            clock: HlcClock::new(shard_version.logical),
            vertices: RwLock::new(BTreeMap::new()),
            edges: DashMap::new(),
            schemas,
            indices: Indices::default(),
            name_mapping: RwLock::new(NameMapping::default()),
            transactions: Mutex::new(BTreeMap::new()),
            commit_lock: Mutex::new(()),
            deleted_vertices: Mutex::new(Vec::new()),
            deleted_edges: Mutex::new(Vec::new()),
            epochs: EpochRegistry::new(),
            deferred_vertices: DeferredDeleter::new(),
            deferred_edges: DeferredDeleter::new(),
            deferred_deltas: DeferredDeleter::new(),
            config,
            isolation_level: Mutex::new(IsolationLevel::SnapshotIsolation),
            wal: RwLock::new(None),
        };
        shard.store_mapping(id_to_name);
        Ok(shard)
    }

    /// Opens a transactional accessor. The start timestamp is allocated
    /// from the shard's clock and is greater than every previously issued
    /// start and observed commit timestamp.
    pub fn access(&self, override_isolation_level: Option<IsolationLevel>) -> Accessor<'_> {
        let isolation = override_isolation_level.unwrap_or(*self.isolation_level.lock());
        let start = self.clock.tick();
        let transaction = Arc::new(Transaction::new(start, isolation));
        self.transactions
            .lock()
            .insert(start.logical, Arc::clone(&transaction));
        debug!(start = start.logical, "transaction started");
        Accessor {
            shard: self,
            transaction,
            _epoch: self.epochs.pin(),
            finished: false,
        }
    }

    /// Attaches the durability collaborator. Committed operations are
    /// streamed to the sink from then on.
    pub fn attach_wal(&self, sink: Arc<dyn WalSink>) {
        *self.wal.write() = Some(sink);
    }

    /// The primary label whose key space this shard partitions.
    pub fn primary_label(&self) -> LabelId {
        self.primary_label
    }

    /// The shard version stamp.
    pub fn version(&self) -> Hlc {
        self.shard_version
    }

    /// The inclusive low end of the owned key range.
    pub fn low_key(&self) -> &PrimaryKey {
        &self.min_primary_key
    }

    /// The exclusive high end of the owned key range, unbounded when
    /// `None`.
    pub fn high_key(&self) -> Option<&PrimaryKey> {
        self.max_primary_key.as_ref()
    }

    /// True when the id resolves into this shard's label and key range.
    pub fn is_vertex_belong_to_shard(&self, vertex_id: &VertexId) -> bool {
        vertex_id.primary_label == self.primary_label
            && self.key_in_range(&vertex_id.primary_key)
    }

    /// Sets the default isolation level for future accessors.
    pub fn set_isolation_level(&self, isolation_level: IsolationLevel) {
        *self.isolation_level.lock() = isolation_level;
    }

    /// Replaces the id-to-name mapping for labels, properties and edge
    /// types.
    pub fn store_mapping(&self, id_to_name: HashMap<u64, String>) {
        let mut mapping = self.name_mapping.write();
        mapping.name_to_id = id_to_name
            .iter()
            .map(|(id, name)| (name.clone(), *id))
            .collect();
        mapping.id_to_name = id_to_name;
    }

    /// Resolves a label name to its id.
    pub fn name_to_label(&self, name: &str) -> Option<LabelId> {
        self.name_mapping
            .read()
            .name_to_id
            .get(name)
            .map(|id| LabelId::new(*id))
    }

    /// Resolves a property name to its id.
    pub fn name_to_property(&self, name: &str) -> Option<PropertyId> {
        self.name_mapping
            .read()
            .name_to_id
            .get(name)
            .map(|id| PropertyId::new(*id))
    }

    /// Resolves an edge-type name to its id.
    pub fn name_to_edge_type(&self, name: &str) -> Option<EdgeTypeId> {
        self.name_mapping
            .read()
            .name_to_id
            .get(name)
            .map(|id| EdgeTypeId::new(*id))
    }

    /// Resolves a label id to its name.
    pub fn label_to_name(&self, label: LabelId) -> Option<String> {
        self.name_mapping
            .read()
            .id_to_name
            .get(&label.as_u64())
            .cloned()
    }

    /// Resolves a property id to its name.
    pub fn property_to_name(&self, property: PropertyId) -> Option<String> {
        self.name_mapping
            .read()
            .id_to_name
            .get(&property.as_u64())
            .cloned()
    }

    /// Resolves an edge-type id to its name.
    pub fn edge_type_to_name(&self, edge_type: EdgeTypeId) -> Option<String> {
        self.name_mapping
            .read()
            .id_to_name
            .get(&edge_type.as_u64())
            .cloned()
    }

    /// Creates a label index and synchronously populates it from resident
    /// state. Returns `false` when the index already existed.
    pub fn create_index(&self, label: LabelId) -> bool {
        if !self.indices.label.register(label) {
            return false;
        }
        let arcs: Vec<(PrimaryKey, Arc<RwLock<Vertex>>)> = self
            .vertices
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (key, arc) in arcs {
            if arc.read().has_label(label) {
                self.indices.label.insert(label, key);
            }
        }
        info!(label = label.as_u64(), "label index created");
        true
    }

    /// Drops a label index. Returns `false` ("no change") when it did not
    /// exist.
    pub fn drop_index(&self, label: LabelId) -> bool {
        self.indices.label.unregister(label)
    }

    /// Creates a label+property index and synchronously populates it from
    /// resident state. Returns `false` when it already existed.
    pub fn create_label_property_index(&self, label: LabelId, property: PropertyId) -> bool {
        if !self.indices.label_property.register(label, property) {
            return false;
        }
        let arcs: Vec<(PrimaryKey, Arc<RwLock<Vertex>>)> = self
            .vertices
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (key, arc) in arcs {
            let guard = arc.read();
            if guard.has_label(label) {
                if let Some(value) = guard.properties.get(&property) {
                    self.indices
                        .label_property
                        .insert(label, property, value.clone(), key);
                }
            }
        }
        info!(
            label = label.as_u64(),
            property = property.as_u64(),
            "label+property index created"
        );
        true
    }

    /// Drops a label+property index. Returns `false` when it did not exist.
    pub fn drop_label_property_index(&self, label: LabelId, property: PropertyId) -> bool {
        self.indices.label_property.unregister(label, property)
    }

    /// Lists all registered indices.
    pub fn list_all_indices(&self) -> IndicesInfo {
        IndicesInfo {
            label: self.indices.label.list(),
            label_property: self.indices.label_property.list(),
        }
    }

    /// Registers a primary-key schema for a label. Returns `false` when one
    /// already exists.
    pub fn create_schema(&self, label: LabelId, schema: Vec<SchemaProperty>) -> bool {
        self.schemas.create_schema(label, schema)
    }

    /// Drops the schema for a label. Returns `false` when none existed.
    pub fn drop_schema(&self, label: LabelId) -> bool {
        self.schemas.drop_schema(label)
    }

    /// The schema registered for a label.
    pub fn get_schema(&self, label: LabelId) -> Option<Vec<SchemaProperty>> {
        self.schemas.get(label)
    }

    /// Lists all registered schemas.
    pub fn list_all_schemas(&self) -> Vec<(LabelId, Vec<SchemaProperty>)> {
        self.schemas.list()
    }

    /// Coarse storage statistics.
    pub fn info(&self) -> StorageInfo {
        let vertex_count = self.vertices.read().len() as u64;
        let edge_count = self.edges.len() as u64;
        let average_degree = if vertex_count == 0 {
            0.0
        } else {
            2.0 * edge_count as f64 / vertex_count as f64
        };
        StorageInfo {
            vertex_count,
            edge_count,
            average_degree,
        }
    }

    /// Suggests a split when the vertex container exceeds the configured
    /// threshold. The shard never acts on this itself; the shard map
    /// collaborator owns boundary changes.
    pub fn should_split(&self) -> Option<SuggestedSplitInfo> {
        let vertices = self.vertices.read();
        if (vertices.len() as u64) <= self.config.split_vertex_threshold {
            return None;
        }
        let split_key = vertices.keys().nth(vertices.len() / 2)?.clone();
        if split_key <= self.min_primary_key {
            return None;
        }
        Some(SuggestedSplitInfo {
            primary_label: self.primary_label,
            shard_version: self.shard_version,
            low_key: self.min_primary_key.clone(),
            split_key,
        })
    }

    pub(crate) fn key_in_range(&self, key: &PrimaryKey) -> bool {
        if *key < self.min_primary_key {
            return false;
        }
        match &self.max_primary_key {
            Some(max) => key < max,
            None => true,
        }
    }

    pub(crate) fn check_in_range(&self, key: &PrimaryKey) -> Result<()> {
        if self.key_in_range(key) {
            Ok(())
        } else {
            Err(ShardError::OutOfRange)
        }
    }

    fn wal_sink(&self) -> Option<Arc<dyn WalSink>> {
        self.wal.read().clone()
    }

    pub(crate) fn mapping_snapshot(&self) -> HashMap<u64, String> {
        self.name_mapping.read().id_to_name.clone()
    }

    /// Finalizes a transaction by id: commits it at `commit_timestamp`, or
    /// aborts it when `None`. Exists for transactions that were duplicated
    /// into this shard by a split: their commit cell is shared with every
    /// other copy, so publication is idempotent, while the unwind and the
    /// deletion queues are local to each shard's containers.
    pub fn finalize_transaction(
        &self,
        id: TransactionId,
        commit_timestamp: Option<Hlc>,
    ) -> Result<()> {
        let transaction = self
            .transactions
            .lock()
            .get(&id.logical())
            .cloned()
            .ok_or(ShardError::NonexistentObject)?;
        match commit_timestamp {
            Some(timestamp) => {
                if transaction.is_active() {
                    self.clock.observe(timestamp);
                    transaction.commit_info().publish(timestamp.logical);
                    transaction.mark_committed(timestamp);
                }
                self.queue_visible_deletions(&transaction);
            }
            None => {
                if transaction.is_active() {
                    self.unwind_transaction(&transaction);
                }
            }
        }
        Ok(())
    }

    /// Re-applies every delta the transaction created to the materialized
    /// fields and unlinks them from their chains, then marks the
    /// transaction aborted. Aborted work was never observable, so no other
    /// transaction is consulted.
    pub(crate) fn unwind_transaction(&self, transaction: &Transaction) {
        let targets = transaction.write_targets();
        for target in &targets {
            match target {
                WriteTarget::Vertex(key) => {
                    let Some(arc) = self.vertices.read().get(key).cloned() else {
                        continue;
                    };
                    let mut vertex = arc.write();
                    loop {
                        match vertex.delta.take() {
                            None => break,
                            Some(mut delta) => {
                                if Arc::ptr_eq(&delta.commit_info, transaction.commit_info()) {
                                    let next = delta.next.take();
                                    vertex.apply_action(&delta.action);
                                    vertex.delta = next;
                                } else {
                                    vertex.delta = Some(delta);
                                    break;
                                }
                            }
                        }
                    }
                    if vertex.deleted {
                        self.deleted_vertices.lock().push(key.clone());
                    }
                }
                WriteTarget::Edge(gid) => {
                    let Some(arc) = self
                        .edges
                        .get(gid)
                        .map(|entry| Arc::clone(entry.value()))
                    else {
                        continue;
                    };
                    let mut edge = arc.write();
                    loop {
                        match edge.delta.take() {
                            None => break,
                            Some(mut delta) => {
                                if Arc::ptr_eq(&delta.commit_info, transaction.commit_info()) {
                                    let next = delta.next.take();
                                    edge.apply_action(&delta.action);
                                    edge.delta = next;
                                } else {
                                    edge.delta = Some(delta);
                                    break;
                                }
                            }
                        }
                    }
                    if edge.deleted {
                        self.deleted_edges.lock().push(*gid);
                    }
                }
            }
        }
        transaction.take_wal();
        transaction.mark_aborted();
        debug!(
            start = transaction.id().logical(),
            writes = targets.len(),
            "transaction aborted"
        );
    }

    /// Queues the transaction's logically deleted objects for the garbage
    /// collector.
    pub(crate) fn queue_visible_deletions(&self, transaction: &Transaction) {
        for target in transaction.write_targets() {
            match target {
                WriteTarget::Vertex(key) => {
                    if let Some(arc) = self.vertices.read().get(&key).cloned() {
                        if arc.read().deleted {
                            self.deleted_vertices.lock().push(key);
                        }
                    }
                }
                WriteTarget::Edge(gid) => {
                    if let Some(arc) = self.edges.get(&gid).map(|entry| Arc::clone(entry.value()))
                    {
                        if arc.read().deleted {
                            self.deleted_edges.lock().push(gid);
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("primary_label", &self.primary_label)
            .field("min_primary_key", &self.min_primary_key)
            .field("max_primary_key", &self.max_primary_key)
            .field("shard_version", &self.shard_version)
            .finish_non_exhaustive()
    }
}

/// A transactional accessor: the only way to read or mutate a shard.
///
/// Dropping an accessor whose transaction is still active aborts it.
pub struct Accessor<'a> {
    shard: &'a Shard,
    transaction: Arc<Transaction>,
    _epoch: EpochGuard<'a>,
    finished: bool,
}

impl<'a> Accessor<'a> {
    /// The underlying transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// The transaction's start timestamp.
    pub fn start_timestamp(&self) -> Hlc {
        self.transaction.start_timestamp()
    }

    fn tx_id(&self) -> TransactionId {
        self.transaction.id()
    }

    fn start_logical(&self) -> u64 {
        self.transaction.start_timestamp().logical
    }

    fn resolve_vertex(&self, key: &PrimaryKey) -> Result<Arc<RwLock<Vertex>>> {
        self.shard.check_in_range(key)?;
        self.shard
            .vertices
            .read()
            .get(key)
            .cloned()
            .ok_or(ShardError::NonexistentObject)
    }

    fn resolve_edge(&self, gid: Gid) -> Result<Arc<RwLock<Edge>>> {
        self.shard
            .edges
            .get(&gid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ShardError::NonexistentObject)
    }

    fn materialized_vertex_snapshot(&self, vertex: &Vertex) -> VertexSnapshot {
        VertexSnapshot {
            id: VertexId::new(self.shard.primary_label, vertex.key.clone()),
            labels: vertex.labels.clone(),
            properties: vertex.properties.clone(),
            in_edges: vertex.in_edges.clone(),
            out_edges: vertex.out_edges.clone(),
        }
    }

    /// Creates a vertex after validating the primary key against the
    /// shard's schema and range. Fails with `VertexAlreadyInserted` when a
    /// vertex with the same key is visible to this transaction.
    pub fn create_vertex(
        &self,
        labels: &[LabelId],
        primary_key: Vec<PropertyValue>,
        properties: Vec<(PropertyId, PropertyValue)>,
    ) -> Result<VertexId> {
        let schema = self
            .shard
            .schemas
            .get(self.shard.primary_label)
            .ok_or_else(|| {
                ShardError::SchemaViolation("no schema registered for the primary label".into())
            })?;
        validate_primary_key(&schema, &primary_key)?;
        if labels.contains(&self.shard.primary_label) {
            return Err(ShardError::SchemaViolation(
                "the primary label is implicit and cannot be assigned".into(),
            ));
        }
        for (property, _) in &properties {
            if schema.iter().any(|part| part.property == *property) {
                return Err(ShardError::SchemaViolation(
                    "primary-key properties cannot be set directly".into(),
                ));
            }
        }
        let key = PrimaryKey(primary_key);
        self.shard.check_in_range(&key)?;

        let properties: Vec<(PropertyId, PropertyValue)> = properties
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();

        let arc = {
            let mut container = self.shard.vertices.write();
            match container.entry(key.clone()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    // A fresh record starts logically deleted with an empty
                    // chain, so creation and delete-then-recreate share one
                    // code path below.
                    let mut vertex = Vertex::new(key.clone());
                    vertex.deleted = true;
                    let arc = Arc::new(RwLock::new(vertex));
                    entry.insert(Arc::clone(&arc));
                    arc
                }
            }
        };

        let commit_info = self.transaction.commit_info();
        {
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if !vertex.deleted {
                return Err(ShardError::VertexAlreadyInserted);
            }
            debug_assert!(
                vertex.in_edges.is_empty() && vertex.out_edges.is_empty(),
                "a deleted vertex cannot carry edge links"
            );
            vertex.deleted = false;
            vertex.push_delta(commit_info, DeltaAction::DeleteObject);
            // Clear residual state from a previous incarnation, recording
            // inverses so older snapshots still reconstruct it.
            let residual_labels: Vec<LabelId> = vertex.labels.to_vec();
            for label in residual_labels {
                vertex.labels.retain(|l| *l != label);
                vertex.push_delta(commit_info, DeltaAction::AddLabel(label));
            }
            let residual_properties: Vec<(PropertyId, PropertyValue)> = vertex
                .properties
                .iter()
                .map(|(p, v)| (*p, v.clone()))
                .collect();
            for (property, old) in residual_properties {
                vertex.properties.remove(&property);
                vertex.push_delta(
                    commit_info,
                    DeltaAction::SetProperty {
                        key: property,
                        value: old,
                    },
                );
            }
            for label in labels {
                vertex.labels.push(*label);
                vertex.push_delta(commit_info, DeltaAction::RemoveLabel(*label));
            }
            for (property, value) in &properties {
                vertex.properties.insert(*property, value.clone());
                vertex.push_delta(
                    commit_info,
                    DeltaAction::SetProperty {
                        key: *property,
                        value: PropertyValue::Null,
                    },
                );
            }
        }

        self.transaction
            .record_write(WriteTarget::Vertex(key.clone()));
        self.transaction.record_wal(WalPayload::VertexCreate {
            key: key.clone(),
            labels: labels.to_vec(),
            properties: properties.clone(),
        });
        for label in labels {
            self.shard.indices.label.insert(*label, key.clone());
            for (property, value) in &properties {
                self.shard.indices.label_property.insert(
                    *label,
                    *property,
                    value.clone(),
                    key.clone(),
                );
            }
        }
        Ok(VertexId::new(self.shard.primary_label, key))
    }

    /// Reads the vertex state visible under `view`.
    pub fn find_vertex(&self, key: &PrimaryKey, view: View) -> Result<VertexSnapshot> {
        let arc = self.resolve_vertex(key)?;
        let guard = arc.read();
        guard
            .snapshot(
                self.shard.primary_label,
                self.tx_id(),
                self.start_logical(),
                view,
            )
            .ok_or(ShardError::NonexistentObject)
    }

    /// Adds a secondary label. Returns `false` when the vertex already
    /// carries it.
    pub fn add_label(&self, key: &PrimaryKey, label: LabelId) -> Result<bool> {
        if label == self.shard.primary_label {
            return Err(ShardError::SchemaViolation(
                "the primary label is implicit and cannot be assigned".into(),
            ));
        }
        let arc = self.resolve_vertex(key)?;
        let commit_info = self.transaction.commit_info();
        let properties = {
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if vertex.deleted {
                return Err(ShardError::DeletedObject);
            }
            if vertex.has_label(label) {
                return Ok(false);
            }
            vertex.labels.push(label);
            vertex.push_delta(commit_info, DeltaAction::RemoveLabel(label));
            vertex
                .properties
                .iter()
                .map(|(p, v)| (*p, v.clone()))
                .collect::<Vec<_>>()
        };
        self.transaction
            .record_write(WriteTarget::Vertex(key.clone()));
        self.transaction.record_wal(WalPayload::AddLabel {
            key: key.clone(),
            label,
        });
        self.shard.indices.label.insert(label, key.clone());
        for (property, value) in properties {
            self.shard
                .indices
                .label_property
                .insert(label, property, value, key.clone());
        }
        Ok(true)
    }

    /// Removes a secondary label. Returns `false` when the vertex did not
    /// carry it.
    pub fn remove_label(&self, key: &PrimaryKey, label: LabelId) -> Result<bool> {
        let arc = self.resolve_vertex(key)?;
        let commit_info = self.transaction.commit_info();
        {
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if vertex.deleted {
                return Err(ShardError::DeletedObject);
            }
            if !vertex.has_label(label) {
                return Ok(false);
            }
            vertex.labels.retain(|l| *l != label);
            vertex.push_delta(commit_info, DeltaAction::AddLabel(label));
        }
        self.transaction
            .record_write(WriteTarget::Vertex(key.clone()));
        self.transaction.record_wal(WalPayload::RemoveLabel {
            key: key.clone(),
            label,
        });
        Ok(true)
    }

    /// Writes a property (`Null` erases it). Returns the previous value.
    pub fn set_property(
        &self,
        key: &PrimaryKey,
        property: PropertyId,
        value: PropertyValue,
    ) -> Result<Option<PropertyValue>> {
        let schema = self.shard.schemas.get(self.shard.primary_label);
        if let Some(schema) = schema {
            if schema.iter().any(|part| part.property == property) {
                return Err(ShardError::SchemaViolation(
                    "primary-key properties cannot be modified".into(),
                ));
            }
        }
        let arc = self.resolve_vertex(key)?;
        let commit_info = self.transaction.commit_info();
        let (old, labels) = {
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if vertex.deleted {
                return Err(ShardError::DeletedObject);
            }
            let old = if value.is_null() {
                vertex.properties.remove(&property)
            } else {
                vertex.properties.insert(property, value.clone())
            };
            vertex.push_delta(
                commit_info,
                DeltaAction::SetProperty {
                    key: property,
                    value: old.clone().unwrap_or(PropertyValue::Null),
                },
            );
            (old, vertex.labels.to_vec())
        };
        self.transaction
            .record_write(WriteTarget::Vertex(key.clone()));
        self.transaction.record_wal(WalPayload::SetProperty {
            key: key.clone(),
            property,
            value: value.clone(),
        });
        if !value.is_null() {
            for label in labels {
                self.shard
                    .indices
                    .label_property
                    .insert(label, property, value.clone(), key.clone());
            }
        }
        Ok(old)
    }

    /// Deletes a vertex with no incident edges. Returns the deleted state,
    /// or `None` when the vertex is already deleted in this transaction's
    /// view.
    pub fn delete_vertex(&self, key: &PrimaryKey) -> Result<Option<VertexSnapshot>> {
        let arc = self.resolve_vertex(key)?;
        let commit_info = self.transaction.commit_info();
        let snapshot = {
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if vertex.deleted {
                return Ok(None);
            }
            if !vertex.in_edges.is_empty() || !vertex.out_edges.is_empty() {
                return Err(ShardError::VertexHasEdges);
            }
            let snapshot = self.materialized_vertex_snapshot(&vertex);
            vertex.deleted = true;
            vertex.push_delta(commit_info, DeltaAction::RecreateObject);
            snapshot
        };
        self.transaction
            .record_write(WriteTarget::Vertex(key.clone()));
        self.transaction
            .record_wal(WalPayload::VertexDelete { key: key.clone() });
        Ok(Some(snapshot))
    }

    /// Deletes a vertex together with all incident edges. Returns the
    /// deleted vertex state and the deleted edges, or `None` when already
    /// deleted.
    pub fn detach_delete_vertex(
        &self,
        key: &PrimaryKey,
    ) -> Result<Option<(VertexSnapshot, Vec<EdgeSnapshot>)>> {
        let (in_links, out_links) = {
            let arc = self.resolve_vertex(key)?;
            let vertex = arc.read();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if vertex.deleted {
                return Ok(None);
            }
            (vertex.in_edges.clone(), vertex.out_edges.clone())
        };
        let own_id = VertexId::new(self.shard.primary_label, key.clone());
        let mut deleted_edges = Vec::new();
        for link in out_links {
            if let Some(snapshot) = self.delete_edge(&own_id, &link.vertex, link.gid)? {
                deleted_edges.push(snapshot);
            }
        }
        for link in in_links {
            if let Some(snapshot) = self.delete_edge(&link.vertex, &own_id, link.gid)? {
                deleted_edges.push(snapshot);
            }
        }
        match self.delete_vertex(key)? {
            Some(snapshot) => Ok(Some((snapshot, deleted_edges))),
            None => Ok(None),
        }
    }

    /// Creates an edge. Both endpoints must resolve to ids this shard can
    /// identify; at least one must be owned locally, and every local
    /// endpoint must exist in this transaction's view. The `gid` is
    /// assigned by the cluster coordinator and must be unique.
    pub fn create_edge(
        &self,
        from: VertexId,
        to: VertexId,
        edge_type: EdgeTypeId,
        gid: Gid,
    ) -> Result<EdgeSnapshot> {
        let from_local = self.shard.is_vertex_belong_to_shard(&from);
        let to_local = self.shard.is_vertex_belong_to_shard(&to);
        if !from_local && !to_local {
            return Err(ShardError::OutOfRange);
        }
        // Validate local endpoints before touching anything.
        for (local, id) in [(from_local, &from), (to_local, &to)] {
            if !local {
                continue;
            }
            let arc = self.resolve_vertex(&id.primary_key)?;
            let vertex = arc.read();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if vertex.deleted {
                return Err(ShardError::DeletedObject);
            }
        }
        let commit_info = self.transaction.commit_info();
        let mut edge = Edge::new(gid, from.clone(), to.clone(), edge_type);
        edge.push_delta(commit_info, DeltaAction::DeleteObject);
        let snapshot = EdgeSnapshot {
            gid,
            from: from.clone(),
            to: to.clone(),
            edge_type,
            properties: BTreeMap::new(),
        };
        match self.shard.edges.entry(gid) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(gid = gid.as_u64(), "edge gid collision");
                return Err(ShardError::Serialization);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(RwLock::new(edge)));
            }
        }

        if from_local {
            let arc = self.resolve_vertex(&from.primary_key)?;
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            let link = EdgeLink {
                edge_type,
                vertex: to.clone(),
                gid,
            };
            vertex.out_edges.push(link.clone());
            vertex.push_delta(commit_info, DeltaAction::RemoveOutEdge(link));
            drop(vertex);
            self.transaction
                .record_write(WriteTarget::Vertex(from.primary_key.clone()));
        }
        if to_local {
            let arc = self.resolve_vertex(&to.primary_key)?;
            let mut vertex = arc.write();
            prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
            let link = EdgeLink {
                edge_type,
                vertex: from.clone(),
                gid,
            };
            vertex.in_edges.push(link.clone());
            vertex.push_delta(commit_info, DeltaAction::RemoveInEdge(link));
            drop(vertex);
            self.transaction
                .record_write(WriteTarget::Vertex(to.primary_key.clone()));
        }
        self.transaction.record_write(WriteTarget::Edge(gid));
        self.transaction.record_wal(WalPayload::EdgeCreate {
            gid,
            from,
            to,
            edge_type,
        });
        Ok(snapshot)
    }

    /// Deletes an edge. Returns the deleted state, or `None` when the edge
    /// is already deleted in this transaction's view.
    pub fn delete_edge(
        &self,
        from: &VertexId,
        to: &VertexId,
        gid: Gid,
    ) -> Result<Option<EdgeSnapshot>> {
        let arc = self.resolve_edge(gid)?;
        let commit_info = self.transaction.commit_info();
        let snapshot = {
            let mut edge = arc.write();
            if edge.from != *from || edge.to != *to {
                return Err(ShardError::NonexistentObject);
            }
            prepare_for_write(edge.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if edge.deleted {
                return Ok(None);
            }
            let snapshot = EdgeSnapshot {
                gid: edge.gid,
                from: edge.from.clone(),
                to: edge.to.clone(),
                edge_type: edge.edge_type,
                properties: edge.properties.clone(),
            };
            edge.deleted = true;
            edge.push_delta(commit_info, DeltaAction::RecreateObject);
            snapshot
        };

        if self.shard.is_vertex_belong_to_shard(from) {
            self.unlink_edge_from_vertex(&from.primary_key, gid, true)?;
        }
        if self.shard.is_vertex_belong_to_shard(to) {
            self.unlink_edge_from_vertex(&to.primary_key, gid, false)?;
        }
        self.transaction.record_write(WriteTarget::Edge(gid));
        self.transaction.record_wal(WalPayload::EdgeDelete {
            gid,
            from: from.clone(),
            to: to.clone(),
        });
        Ok(Some(snapshot))
    }

    fn unlink_edge_from_vertex(
        &self,
        key: &PrimaryKey,
        gid: Gid,
        outgoing: bool,
    ) -> Result<()> {
        let Ok(arc) = self.resolve_vertex(key) else {
            // The endpoint may already have been unlinked by the garbage
            // collector if its deletion is older than every live snapshot.
            return Ok(());
        };
        let commit_info = self.transaction.commit_info();
        let mut vertex = arc.write();
        prepare_for_write(vertex.delta.as_deref(), self.tx_id(), self.start_logical())?;
        let links = if outgoing {
            &mut vertex.out_edges
        } else {
            &mut vertex.in_edges
        };
        let Some(link) = links.iter().find(|l| l.gid == gid).cloned() else {
            return Ok(());
        };
        links.retain(|l| l.gid != gid);
        let action = if outgoing {
            DeltaAction::AddOutEdge(link)
        } else {
            DeltaAction::AddInEdge(link)
        };
        vertex.push_delta(commit_info, action);
        drop(vertex);
        self.transaction
            .record_write(WriteTarget::Vertex(key.clone()));
        Ok(())
    }

    /// Writes an edge property (`Null` erases it). Fails with
    /// `PropertiesDisabled` unless enabled by configuration. Returns the
    /// previous value.
    pub fn set_edge_property(
        &self,
        gid: Gid,
        property: PropertyId,
        value: PropertyValue,
    ) -> Result<Option<PropertyValue>> {
        if !self.shard.config.items.properties_on_edges {
            return Err(ShardError::PropertiesDisabled);
        }
        let arc = self.resolve_edge(gid)?;
        let commit_info = self.transaction.commit_info();
        let old = {
            let mut edge = arc.write();
            prepare_for_write(edge.delta.as_deref(), self.tx_id(), self.start_logical())?;
            if edge.deleted {
                return Err(ShardError::DeletedObject);
            }
            let old = if value.is_null() {
                edge.properties.remove(&property)
            } else {
                edge.properties.insert(property, value.clone())
            };
            edge.push_delta(
                commit_info,
                DeltaAction::SetProperty {
                    key: property,
                    value: old.clone().unwrap_or(PropertyValue::Null),
                },
            );
            old
        };
        self.transaction.record_write(WriteTarget::Edge(gid));
        self.transaction.record_wal(WalPayload::SetEdgeProperty {
            gid,
            property,
            value,
        });
        Ok(old)
    }

    /// Reads the edge state visible under `view`.
    pub fn find_edge(&self, gid: Gid, view: View) -> Result<EdgeSnapshot> {
        let arc = self.resolve_edge(gid)?;
        let guard = arc.read();
        guard
            .snapshot(self.tx_id(), self.start_logical(), view)
            .ok_or(ShardError::NonexistentObject)
    }

    /// Iterates every vertex visible under `view`.
    pub fn vertices(&self, view: View) -> VerticesIterator<'_, 'a> {
        let keys: Vec<PrimaryKey> = self.shard.vertices.read().keys().cloned().collect();
        VerticesIterator::new(self, view, keys, IterStrategy::All)
    }

    /// Iterates vertices carrying `label`, using the label index when one
    /// is registered and a filtered container scan otherwise.
    pub fn vertices_by_label(&self, label: LabelId, view: View) -> VerticesIterator<'_, 'a> {
        let keys = if self.shard.indices.label.is_registered(label) {
            self.shard.indices.label.keys(label)
        } else {
            self.shard.vertices.read().keys().cloned().collect()
        };
        VerticesIterator::new(self, view, keys, IterStrategy::ByLabel(label))
    }

    /// Iterates vertices carrying `label` and `property`, optionally pinned
    /// to one property value. Uses the label+property index when
    /// registered.
    pub fn vertices_by_label_property(
        &self,
        label: LabelId,
        property: PropertyId,
        value: Option<PropertyValue>,
        view: View,
    ) -> VerticesIterator<'_, 'a> {
        let keys = if self.shard.indices.label_property.is_registered(label, property) {
            self.shard
                .indices
                .label_property
                .keys(label, property, value.as_ref())
        } else {
            self.shard.vertices.read().keys().cloned().collect()
        };
        VerticesIterator::new(
            self,
            view,
            keys,
            IterStrategy::ByLabelProperty(label, property, value),
        )
    }

    /// Approximate number of vertices in the shard. Always an
    /// over-estimate, never an under-estimate.
    pub fn approximate_vertex_count(&self) -> u64 {
        self.shard.vertices.read().len() as u64
    }

    /// Approximate number of vertices carrying `label`. Always an
    /// over-estimate, never an under-estimate.
    pub fn approximate_vertex_count_by_label(&self, label: LabelId) -> u64 {
        self.shard
            .indices
            .label
            .approximate_count(label)
            .unwrap_or_else(|| self.approximate_vertex_count())
    }

    /// Approximate number of vertices carrying `label` with `property`
    /// present. Always an over-estimate, never an under-estimate.
    pub fn approximate_vertex_count_by_label_property(
        &self,
        label: LabelId,
        property: PropertyId,
    ) -> u64 {
        self.shard
            .indices
            .label_property
            .approximate_count(label, property, None)
            .unwrap_or_else(|| self.approximate_vertex_count())
    }

    /// Approximate number of vertices carrying `label` with `property`
    /// equal to `value`. Always an over-estimate, never an under-estimate.
    pub fn approximate_vertex_count_by_label_property_value(
        &self,
        label: LabelId,
        property: PropertyId,
        value: &PropertyValue,
    ) -> u64 {
        self.shard
            .indices
            .label_property
            .approximate_count(label, property, Some(value))
            .unwrap_or_else(|| self.approximate_vertex_count())
    }

    /// Commits the transaction at `commit_timestamp`, supplied by the
    /// ordering collaborator after the write is durable and ordered.
    ///
    /// Re-validates every written object and fails with `Serialization`
    /// when another transaction committed a conflicting write first; the
    /// accessor then aborts on drop and the caller retries the whole
    /// transaction. On success a single release store per commit cell
    /// publishes every delta of the transaction atomically with respect to
    /// new readers.
    pub fn commit(mut self, commit_timestamp: Hlc) -> Result<()> {
        self.commit_inner(commit_timestamp)?;
        self.finished = true;
        Ok(())
    }

    fn commit_inner(&self, commit_timestamp: Hlc) -> Result<()> {
        let _serialize = self.shard.commit_lock.lock();
        let targets = self.transaction.write_targets();
        for target in &targets {
            match target {
                WriteTarget::Vertex(key) => {
                    let Some(arc) = self.shard.vertices.read().get(key).cloned() else {
                        continue;
                    };
                    let guard = arc.read();
                    self.check_commit_conflict(guard.delta.as_deref())?;
                }
                WriteTarget::Edge(gid) => {
                    let Some(arc) = self
                        .shard
                        .edges
                        .get(gid)
                        .map(|entry| Arc::clone(entry.value()))
                    else {
                        continue;
                    };
                    let guard = arc.read();
                    self.check_commit_conflict(guard.delta.as_deref())?;
                }
            }
        }

        self.shard.clock.observe(commit_timestamp);
        self.transaction.commit_info().publish(commit_timestamp.logical);
        self.transaction.mark_committed(commit_timestamp);
        self.shard.queue_visible_deletions(&self.transaction);

        if let Some(sink) = self.shard.wal_sink() {
            for payload in self.transaction.take_wal() {
                sink.append(WalRecord {
                    timestamp: commit_timestamp.logical,
                    payload,
                });
            }
            sink.append(WalRecord {
                timestamp: commit_timestamp.logical,
                payload: WalPayload::TransactionEnd,
            });
        }

        debug!(
            start = self.start_logical(),
            commit = commit_timestamp.logical,
            writes = targets.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Scans a chain top-down for a foreign delta committed after this
    /// transaction's start; stops at the transaction's own span.
    fn check_commit_conflict(&self, mut cur: Option<&Delta>) -> Result<()> {
        while let Some(delta) = cur {
            match delta.commit_info.state() {
                CommitState::Uncommitted(owner) if owner == self.tx_id() => return Ok(()),
                CommitState::Committed(ts) if ts > self.start_logical() => {
                    return Err(ShardError::Serialization)
                }
                _ => cur = delta.next.as_deref(),
            }
        }
        Ok(())
    }

    /// Aborts the transaction, unwinding every delta it created: each
    /// recorded inverse is re-applied to the object's materialized fields
    /// and the delta is unlinked from the chain. Aborted work was never
    /// observable, so no other transaction is consulted.
    pub fn abort(mut self) {
        self.abort_inner();
        self.finished = true;
    }

    fn abort_inner(&self) {
        self.shard.unwind_transaction(&self.transaction);
    }
}

impl Drop for Accessor<'_> {
    fn drop(&mut self) {
        if !self.finished && self.transaction.is_active() {
            self.abort_inner();
        }
    }
}
