//! Error handling for shard operations.
//!
//! All accessor and admin APIs return [`Result<T>`]. The variants map the
//! failure modes a caller can act on: [`ShardError::Serialization`] is the
//! only retryable kind (optimistic-concurrency conflict, retry the whole
//! transaction); everything else reports a caller or schema error. Truly
//! unexpected conditions (a corrupted delta chain) are not representable
//! here; they panic, since they indicate an engine bug rather than a
//! recoverable runtime condition.

use thiserror::Error;

/// Result type for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;

/// Errors surfaced by transactional accessors and shard administration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    /// Optimistic-concurrency conflict: another transaction wrote the same
    /// object inside an overlapping snapshot. The caller must abort and
    /// retry the whole transaction.
    #[error("serialization conflict, retry the transaction")]
    Serialization,

    /// The key or id does not resolve to an object under the given view.
    #[error("object does not exist in the visible snapshot")]
    NonexistentObject,

    /// The operation targets an object that is already deleted in the
    /// caller's visible snapshot.
    #[error("object was deleted")]
    DeletedObject,

    /// A plain delete was attempted on a vertex that still has incident
    /// edges; use detach-delete instead.
    #[error("vertex still has incident edges")]
    VertexHasEdges,

    /// Primary-key collision on vertex creation.
    #[error("a vertex with the same primary key already exists")]
    VertexAlreadyInserted,

    /// Edge properties are disabled by configuration.
    #[error("properties on edges are disabled")]
    PropertiesDisabled,

    /// A primary-key or property value violates the declared schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The primary key falls outside the shard's `[min, max)` range. This
    /// indicates a routing error by the caller, not a storage bug.
    #[error("primary key is outside the shard's key range")]
    OutOfRange,

    /// Invalid configuration or shard construction parameters.
    #[error("invalid configuration: {0}")]
    Config(String),
}
