use cask_envelope::EnvelopeError;
use cask_types::EnvelopeId;

/// Errors from envelope store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stored bytes no longer hash to their identity. The envelope has been
    /// quarantined and will not be served again until re-ingested.
    #[error("hash mismatch for envelope {id}: stored bytes hash to {computed}; envelope quarantined")]
    HashMismatch {
        id: EnvelopeId,
        computed: EnvelopeId,
    },

    /// The envelope was quarantined by an earlier failed read.
    #[error("envelope {0} is quarantined after failing identity verification")]
    Quarantined(EnvelopeId),

    /// Stored bytes for an envelope do not follow the canonical layout.
    #[error("corrupt envelope {id}: {source}")]
    Corrupt {
        id: EnvelopeId,
        #[source]
        source: EnvelopeError,
    },

    /// An envelope offered for insertion does not verify.
    #[error("rejected envelope {id}: {source}")]
    Rejected {
        id: EnvelopeId,
        #[source]
        source: EnvelopeError,
    },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
