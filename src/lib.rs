//! Per-shard transactional storage engine for a distributed property-graph
//! database.
//!
//! Each [`Shard`] owns a contiguous primary-key range and runs its own
//! multi-version concurrency control: every mutation appends an undo-log
//! [`storage::delta::Delta`] ordered by a hybrid logical clock, readers
//! reconstruct the snapshot of their start timestamp by walking the chain,
//! and commit publishes a whole transaction with a single atomic store into
//! the shared commit cell. Snapshot isolation is the provided level;
//! write-write conflicts surface as [`ShardError::Serialization`] and are
//! retried by the caller.
//!
//! Around the core sit the garbage collector ([`db::gc`]), which trims
//! chains from their oldest end once no live snapshot can observe them and
//! returns memory through an epoch-based deferred-free queue, and the
//! splitter ([`db::splitter`]), which divides a shard's live state,
//! uncommitted work included, into two self-consistent shards at a key
//! boundary.
//!
//! Replication, consensus, query planning and durable storage are external
//! collaborators: commit timestamps arrive from the cluster's ordering
//! layer, and committed operations stream out through [`db::wal::WalSink`].

pub mod db;
pub mod error;
pub mod index;
pub mod logging;
pub mod storage;

pub use db::config::{Config, GcConfig, Items};
pub use db::gc::{BackgroundGc, GcStats};
pub use db::hlc::{Hlc, HlcClock};
pub use db::shard::{Accessor, IndicesInfo, Shard, StorageInfo, SuggestedSplitInfo};
pub use db::splitter::SplitData;
pub use db::transaction::{IsolationLevel, Transaction, TransactionId};
pub use db::wal::{MemoryWal, WalPayload, WalRecord, WalSink};
pub use db::wal::replay_into;
pub use error::{Result, ShardError};
pub use index::VerticesIterator;
pub use logging::init_logging;
pub use storage::delta::{CommitInfo, CommitState, Delta, DeltaAction, EdgeLink};
pub use storage::edge::{Edge, EdgeSnapshot};
pub use storage::schema::{SchemaProperty, SchemaType};
pub use storage::value::{EdgeTypeId, Gid, LabelId, PrimaryKey, PropertyId, PropertyValue};
pub use storage::vertex::{Vertex, VertexId, VertexSnapshot};
pub use storage::View;
