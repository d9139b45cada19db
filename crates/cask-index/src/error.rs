use cask_store::StoreError;
use cask_types::EnvelopeId;

/// Errors from index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The query cannot be answered by any index.
    #[error("invalid query on field {field:?}: {reason}")]
    InvalidQuery { field: String, reason: String },

    /// Replaying extraction for an identity failed; the index cannot be
    /// brought back in line with the store for it.
    #[error("index replay failed for envelope {id}: {reason}")]
    ReplayFailed { id: EnvelopeId, reason: String },

    /// Store error while scanning or replaying.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;
