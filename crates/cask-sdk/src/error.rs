use cask_dag::DagError;
use cask_envelope::EnvelopeError;
use cask_index::IndexError;
use cask_refs::LineageError;
use cask_store::StoreError;
use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of every failure the SDK can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or oversized input, rejected before anything is written.
    Encoding,
    /// Stored bytes fail identity verification.
    HashMismatch,
    /// Lookup miss.
    NotFound,
    /// A version chain or relationship would repeat an identity.
    CycleDetected,
    /// Several heads claim the same predecessor.
    ForkDetected,
    /// Indexes and store diverge and replay could not fix it.
    IndexInconsistency,
    Io,
    Internal,
}

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("envelope not found: {0}")]
    NotFound(EnvelopeId),

    #[error("envelope {id} supersedes {previous}, which is not stored")]
    DanglingPrevious { id: EnvelopeId, previous: EnvelopeId },

    #[error("envelope {id} would create a cycle: {reason}")]
    CycleDetected { id: EnvelopeId, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] EnvelopeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("lineage error: {0}")]
    Lineage(#[from] LineageError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdkError {
    /// Which of the error kinds this failure belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SdkError::NotFound(_) => ErrorKind::NotFound,
            SdkError::DanglingPrevious { .. } => ErrorKind::Encoding,
            SdkError::CycleDetected { .. } => ErrorKind::CycleDetected,
            SdkError::Config(_) => ErrorKind::Internal,
            SdkError::Encoding(e) => envelope_kind(e),
            SdkError::Store(e) => store_kind(e),
            SdkError::Index(e) => index_kind(e),
            SdkError::Lineage(e) => lineage_kind(e),
            SdkError::Dag(e) => dag_kind(e),
            SdkError::Io(_) => ErrorKind::Io,
        }
    }

    /// The identity the failure is about, when there is one.
    pub fn envelope_id(&self) -> Option<EnvelopeId> {
        match self {
            SdkError::NotFound(id)
            | SdkError::DanglingPrevious { id, .. }
            | SdkError::CycleDetected { id, .. } => Some(*id),
            SdkError::Encoding(EnvelopeError::HashMismatch { stored, .. }) => Some(*stored),
            SdkError::Store(
                StoreError::HashMismatch { id, .. }
                | StoreError::Quarantined(id)
                | StoreError::Corrupt { id, .. }
                | StoreError::Rejected { id, .. },
            ) => Some(*id),
            SdkError::Index(IndexError::ReplayFailed { id, .. }) => Some(*id),
            SdkError::Lineage(LineageError::CycleDetected { id, .. }) => Some(*id),
            SdkError::Dag(
                DagError::NotFound(id)
                | DagError::ForkDetected { id, .. }
                | DagError::UnresolvedSchema { id, .. }
                | DagError::SchemaTooDeep { id, .. },
            ) => Some(*id),
            _ => None,
        }
    }
}

fn envelope_kind(e: &EnvelopeError) -> ErrorKind {
    if e.is_encoding() {
        ErrorKind::Encoding
    } else {
        ErrorKind::HashMismatch
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::HashMismatch { .. } | StoreError::Quarantined(_) | StoreError::Corrupt { .. } => {
            ErrorKind::HashMismatch
        }
        StoreError::Rejected { source, .. } => envelope_kind(source),
        StoreError::Io(_) => ErrorKind::Io,
    }
}

fn index_kind(e: &IndexError) -> ErrorKind {
    match e {
        IndexError::InvalidQuery { .. } => ErrorKind::Encoding,
        IndexError::ReplayFailed { .. } => ErrorKind::IndexInconsistency,
        IndexError::Store(e) => store_kind(e),
    }
}

fn lineage_kind(e: &LineageError) -> ErrorKind {
    match e {
        LineageError::CycleDetected { .. } => ErrorKind::CycleDetected,
        LineageError::Store(e) => store_kind(e),
        LineageError::Io(_) => ErrorKind::Io,
        LineageError::Conflict { .. }
        | LineageError::Contended { .. }
        | LineageError::Serialization(_) => ErrorKind::Internal,
    }
}

fn dag_kind(e: &DagError) -> ErrorKind {
    match e {
        DagError::NotFound(_) => ErrorKind::NotFound,
        DagError::ForkDetected { .. } => ErrorKind::ForkDetected,
        DagError::UnresolvedSchema { .. } | DagError::SchemaTooDeep { .. } => ErrorKind::Encoding,
        DagError::Store(e) => store_kind(e),
        DagError::Lineage(e) => lineage_kind(e),
    }
}

pub type SdkResult<T> = Result<T, SdkError>;
