use cask_envelope::Envelope;
use cask_types::EnvelopeId;

use crate::error::StoreResult;

/// Outcome of [`EnvelopeStore::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// The envelope was written by this call.
    Inserted,
    /// An envelope with the same identity was already stored; nothing written.
    AlreadyPresent,
}

impl Insertion {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Content-addressed envelope store.
///
/// All implementations must satisfy these invariants:
/// - Envelopes are immutable once written; the identity is the content hash,
///   so equal identities imply equal bytes.
/// - `insert` is an atomic insert-if-absent. Concurrent inserts of the same
///   envelope converge to exactly one stored copy.
/// - A failed insert leaves nothing visible to `read`.
/// - Reads of corrupted bytes fail with a hash mismatch and quarantine the
///   identity instead of returning the bytes.
pub trait EnvelopeStore: Send + Sync {
    /// Read an envelope by identity. `Ok(None)` if it is not stored.
    fn read(&self, id: &EnvelopeId) -> StoreResult<Option<Envelope>>;

    /// Store an envelope unless one with the same identity exists.
    fn insert(&self, envelope: &Envelope) -> StoreResult<Insertion>;

    /// Whether an envelope with this identity is stored.
    fn exists(&self, id: &EnvelopeId) -> StoreResult<bool>;

    /// Every stored identity, sorted.
    fn ids(&self) -> StoreResult<Vec<EnvelopeId>>;

    /// Number of stored envelopes.
    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Identities whose stored bytes failed verification.
    fn quarantined(&self) -> Vec<EnvelopeId>;

    /// Physically remove envelopes. Returns how many were removed.
    ///
    /// Only compaction may call this; the store is otherwise append-only.
    fn remove(&self, ids: &[EnvelopeId]) -> StoreResult<usize>;

    /// Read several envelopes. Backends may override for fewer round-trips.
    fn read_batch(&self, ids: &[EnvelopeId]) -> StoreResult<Vec<Option<Envelope>>> {
        ids.iter().map(|id| self.read(id)).collect()
    }
}
