//! Error types for chain resolution and graph traversal.

use cask_refs::LineageError;
use cask_store::StoreError;
use cask_types::EnvelopeId;

/// Errors that can occur while resolving chains or walking the graph.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// No stored envelope or tracked lineage has this identity.
    #[error("envelope not found: {0}")]
    NotFound(EnvelopeId),

    /// Several heads are reachable; the caller must pick one.
    #[error("lineage of {id} forked into {} heads", heads.len())]
    ForkDetected {
        /// The member whose head was requested.
        id: EnvelopeId,
        /// Every reachable head, sorted.
        heads: Vec<EnvelopeId>,
    },

    /// A schema in the type chain of `id` is not stored.
    #[error("type chain of {id} cannot be resolved: schema {schema} is not stored")]
    UnresolvedSchema { id: EnvelopeId, schema: EnvelopeId },

    /// The type chain of `id` is longer than the configured bound.
    #[error("type chain of {id} exceeds {max_depth} schemas")]
    SchemaTooDeep { id: EnvelopeId, max_depth: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),
}

/// Convenience alias for DAG results.
pub type DagResult<T> = Result<T, DagError>;
