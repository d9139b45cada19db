use cask_types::{EnvelopeId, TypeError};

/// Errors from encoding, decoding, or verifying envelopes.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// A relation was declared with no targets.
    #[error("relation {relation:?} has an empty target set")]
    EmptyRelation { relation: String },

    /// Two index field names normalize to the same key.
    #[error("index fields {first:?} and {second:?} collide as {normalized:?}")]
    FieldCollision {
        normalized: String,
        first: String,
        second: String,
    },

    /// The payload exceeds the configured maximum.
    #[error("payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The encoded envelope does not fit the 32-bit section offsets.
    #[error("canonical envelope of {size} bytes exceeds the layout limit")]
    TooLarge { size: usize },

    /// A relation name, field name, or type name is unusable.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// An index value cannot be encoded canonically.
    #[error("invalid value for field {field:?}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// A tombstone must name the identity it supersedes.
    #[error("tombstone without a superseded identity")]
    TombstoneWithoutTarget,

    /// Bytes do not follow the canonical layout.
    #[error("malformed envelope at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    /// Stored identity does not match the hash of the canonical bytes.
    #[error("hash mismatch: stored identity {stored}, computed {computed}")]
    HashMismatch {
        stored: EnvelopeId,
        computed: EnvelopeId,
    },

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl EnvelopeError {
    /// Returns `true` for malformed or oversized input, i.e. everything
    /// except an integrity failure.
    pub fn is_encoding(&self) -> bool {
        !matches!(self, Self::HashMismatch { .. })
    }

    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::Malformed {
            offset,
            reason: reason.into(),
        }
    }
}

/// Result alias for envelope operations.
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
