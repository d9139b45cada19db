//! Error types for lineage tracking.

use cask_store::StoreError;
use cask_types::EnvelopeId;
use thiserror::Error;

/// Errors that can occur while reading or advancing lineages.
#[derive(Debug, Error)]
pub enum LineageError {
    /// The lineage changed between read and compare-and-swap.
    #[error("lineage {root} changed concurrently: expected version {expected:?}, found {actual:?}")]
    Conflict {
        root: EnvelopeId,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// Compare-and-swap kept losing to concurrent writers.
    #[error("lineage {root} still contended after {attempts} attempts")]
    Contended { root: EnvelopeId, attempts: usize },

    /// Recording the envelope would repeat an identity in its version chain.
    #[error("envelope {id} would repeat an identity in the version chain through {previous}")]
    CycleDetected { id: EnvelopeId, previous: EnvelopeId },

    /// Snapshot (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store error while rebuilding from a full scan.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error while persisting or loading a snapshot.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for LineageError {
    fn from(e: serde_json::Error) -> Self {
        LineageError::Serialization(e.to_string())
    }
}

/// Convenience type alias for lineage operations.
pub type LineageResult<T> = std::result::Result<T, LineageError>;
