//! Online range split.
//!
//! [`Shard::perform_split`] partitions a shard's live state, committed and
//! uncommitted alike, at a primary-key boundary into
//! two self-consistent [`SplitData`] halves. It is a pure, synchronous,
//! single-threaded transformation over resident containers: no network
//! I/O, no coordination, so it is testable as a deterministic function.
//! The parent shard is left untouched; retiring it (or narrowing its
//! range) is a shard-map metadata operation owned by the cluster
//! collaborator, which receives the parent version, both fresh child
//! versions and the boundary key.
//!
//! Assignment rules:
//!
//! - a vertex moves to the side its primary key compares into; its whole
//!   delta chain moves with it (chains belong to exactly one object and are
//!   never split);
//! - an edge whose endpoints land on one side moves wholly there; an edge
//!   straddling the boundary is duplicated into both sides' containers so
//!   each side keeps a resolvable local view of its vertex's incident
//!   edges. The side owning the edge's `from` endpoint stays authoritative
//!   for the edge's lifecycle;
//! - the whole not-yet-cleaned transaction table is copied to both sides.
//!   Copied live transactions share their commit cell with the parent's,
//!   so one commit or abort by transaction id finalizes the deltas held by
//!   every copy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::db::config::Config;
use crate::db::hlc::Hlc;
use crate::db::shard::Shard;
use crate::db::transaction::Transaction;
use crate::error::{Result, ShardError};
use crate::storage::edge::Edge;
use crate::storage::schema::SchemaProperty;
use crate::storage::value::{Gid, LabelId, PrimaryKey, PropertyId};
use crate::storage::vertex::{Vertex, VertexId};

/// One self-consistent half of a split shard's state, sufficient to build
/// a new [`Shard`] with [`Shard::from_split_data`].
pub struct SplitData {
    /// Primary label of the key space.
    pub primary_label: LabelId,
    /// Low key of the half, inclusive.
    pub min_primary_key: PrimaryKey,
    /// High key of the half, exclusive (`None` = unbounded).
    pub max_primary_key: Option<PrimaryKey>,
    /// Fresh version stamp for the resulting shard.
    pub shard_version: Hlc,
    /// Vertices owned by the half, chains included.
    pub vertices: BTreeMap<PrimaryKey, Vertex>,
    /// Edges resident on the half, including straddling duplicates.
    pub edges: HashMap<Gid, Edge>,
    /// Copies of the parent's transaction table, sharing commit cells.
    pub transactions: BTreeMap<u64, Arc<Transaction>>,
    /// Label indices to re-register.
    pub label_indices: Vec<LabelId>,
    /// Label+property indices to re-register.
    pub label_property_indices: Vec<(LabelId, PropertyId)>,
    /// All primary-key schemas.
    pub schemas: Vec<(LabelId, Vec<SchemaProperty>)>,
    /// Id-to-name mapping.
    pub id_to_name: HashMap<u64, String>,
}

impl std::fmt::Debug for SplitData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitData")
            .field("min_primary_key", &self.min_primary_key)
            .field("max_primary_key", &self.max_primary_key)
            .field("shard_version", &self.shard_version)
            .field("vertices", &self.vertices.len())
            .field("edges", &self.edges.len())
            .field("transactions", &self.transactions.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Low,
    High,
}

impl Shard {
    fn vertex_side(&self, split_key: &PrimaryKey, id: &VertexId) -> Option<Side> {
        if !self.is_vertex_belong_to_shard(id) {
            return None;
        }
        if id.primary_key < *split_key {
            Some(Side::Low)
        } else {
            Some(Side::High)
        }
    }

    /// Splits the shard's live state at `split_key`, stamping the low half
    /// with `new_low_version` and the high half with `new_high_version`
    /// (both assigned by the shard map collaborator, distinct from the
    /// parent's version).
    pub fn perform_split(
        &self,
        split_key: &PrimaryKey,
        new_low_version: Hlc,
        new_high_version: Hlc,
    ) -> Result<(SplitData, SplitData)> {
        if *split_key <= self.min_primary_key {
            return Err(ShardError::OutOfRange);
        }
        if let Some(max) = &self.max_primary_key {
            if *split_key >= *max {
                return Err(ShardError::OutOfRange);
            }
        }

        let mut low_vertices = BTreeMap::new();
        let mut high_vertices = BTreeMap::new();
        for (key, arc) in self.vertices.read().iter() {
            let vertex = arc.read().clone();
            if *key < *split_key {
                low_vertices.insert(key.clone(), vertex);
            } else {
                high_vertices.insert(key.clone(), vertex);
            }
        }

        let mut low_edges = HashMap::new();
        let mut high_edges = HashMap::new();
        for entry in self.edges.iter() {
            let edge = entry.value().read().clone();
            let from_side = self.vertex_side(split_key, &edge.from);
            let to_side = self.vertex_side(split_key, &edge.to);
            match (from_side, to_side) {
                (None, None) => {
                    // Neither endpoint resolves locally; the edge cannot
                    // have been created here.
                    unreachable!("resident edge with no local endpoint");
                }
                (Some(side), None) | (None, Some(side)) => {
                    let target = match side {
                        Side::Low => &mut low_edges,
                        Side::High => &mut high_edges,
                    };
                    target.insert(edge.gid, edge);
                }
                (Some(a), Some(b)) if a == b => {
                    let target = match a {
                        Side::Low => &mut low_edges,
                        Side::High => &mut high_edges,
                    };
                    target.insert(edge.gid, edge);
                }
                (Some(_), Some(_)) => {
                    // Straddling edge: both sides keep it resident so each
                    // can resolve its own endpoint's incident edges. Gid
                    // uniqueness holds per side; the `from` side owns the
                    // edge's lifecycle.
                    low_edges.insert(edge.gid, edge.clone());
                    high_edges.insert(edge.gid, edge);
                }
            }
        }

        let transactions: Vec<(u64, Arc<Transaction>)> = self
            .transactions
            .lock()
            .iter()
            .map(|(start, tx)| (*start, Arc::clone(tx)))
            .collect();
        let duplicate_table = || -> BTreeMap<u64, Arc<Transaction>> {
            transactions
                .iter()
                .map(|(start, tx)| (*start, Arc::new(tx.duplicate_for_split())))
                .collect()
        };

        let label_indices = self.indices.label.list();
        let label_property_indices = self.indices.label_property.list();
        let schemas = self.schemas.list();
        let id_to_name = self.mapping_snapshot();

        let low = SplitData {
            primary_label: self.primary_label,
            min_primary_key: self.min_primary_key.clone(),
            max_primary_key: Some(split_key.clone()),
            shard_version: new_low_version,
            vertices: low_vertices,
            edges: low_edges,
            transactions: duplicate_table(),
            label_indices: label_indices.clone(),
            label_property_indices: label_property_indices.clone(),
            schemas: schemas.clone(),
            id_to_name: id_to_name.clone(),
        };
        let high = SplitData {
            primary_label: self.primary_label,
            min_primary_key: split_key.clone(),
            max_primary_key: self.max_primary_key.clone(),
            shard_version: new_high_version,
            vertices: high_vertices,
            edges: high_edges,
            transactions: duplicate_table(),
            label_indices,
            label_property_indices,
            schemas,
            id_to_name,
        };
        info!(
            low_vertices = low.vertices.len(),
            high_vertices = high.vertices.len(),
            low_edges = low.edges.len(),
            high_edges = high.edges.len(),
            transactions = low.transactions.len(),
            "shard split performed"
        );
        Ok((low, high))
    }

    /// Builds a shard from one half of a split.
    pub fn from_split_data(data: SplitData, config: Config) -> Result<Shard> {
        let SplitData {
            primary_label,
            min_primary_key,
            max_primary_key,
            shard_version,
            vertices,
            edges,
            transactions,
            label_indices,
            label_property_indices,
            schemas,
            id_to_name,
        } = data;

        // The clock must stay ahead of every timestamp resident in the
        // copied state.
        let mut clock_floor = shard_version.logical;
        for (start, tx) in &transactions {
            clock_floor = clock_floor.max(*start);
            if let Some(commit) = tx.commit_timestamp() {
                clock_floor = clock_floor.max(commit.logical);
            }
        }

        let primary_schema = schemas
            .iter()
            .find(|(label, _)| *label == primary_label)
            .map(|(_, schema)| schema.clone())
            .ok_or_else(|| {
                ShardError::SchemaViolation("split data carries no primary schema".into())
            })?;
        let shard = Shard::new(
            primary_label,
            min_primary_key,
            max_primary_key,
            primary_schema,
            shard_version,
            config,
            id_to_name,
        )?;
        shard.clock.observe(Hlc::from_logical(clock_floor));
        for (label, schema) in schemas {
            shard.create_schema(label, schema);
        }

        {
            let mut container = shard.vertices.write();
            for (key, vertex) in vertices {
                if vertex.deleted {
                    shard.deleted_vertices.lock().push(key.clone());
                }
                container.insert(key, Arc::new(RwLock::new(vertex)));
            }
        }
        for (gid, edge) in edges {
            if edge.deleted {
                shard.deleted_edges.lock().push(gid);
            }
            shard.edges.insert(gid, Arc::new(RwLock::new(edge)));
        }
        *shard.transactions.lock() = transactions;

        for label in label_indices {
            shard.create_index(label);
        }
        for (label, property) in label_property_indices {
            shard.create_label_property_index(label, property);
        }
        Ok(shard)
    }
}
