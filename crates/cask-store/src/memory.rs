use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::RwLock;

use cask_envelope::Envelope;
use cask_types::EnvelopeId;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{EnvelopeStore, Insertion};

/// In-memory, HashMap-based envelope store.
///
/// Intended for tests and embedding. Envelopes share their byte buffers, so
/// reads are a reference-count bump rather than a copy.
pub struct InMemoryEnvelopeStore {
    envelopes: RwLock<HashMap<EnvelopeId, Envelope>>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self {
            envelopes: RwLock::new(HashMap::new()),
        }
    }

    /// Total stored bytes, identities included.
    pub fn total_bytes(&self) -> u64 {
        self.envelopes
            .read()
            .expect("lock poisoned")
            .values()
            .map(|env| env.len() as u64)
            .sum()
    }
}

impl Default for InMemoryEnvelopeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeStore for InMemoryEnvelopeStore {
    fn read(&self, id: &EnvelopeId) -> StoreResult<Option<Envelope>> {
        let map = self.envelopes.read().expect("lock poisoned");
        Ok(map.get(id).cloned())
    }

    fn insert(&self, envelope: &Envelope) -> StoreResult<Insertion> {
        let id = envelope.id();
        envelope
            .view()
            .verify()
            .map_err(|source| StoreError::Rejected { id, source })?;

        let mut map = self.envelopes.write().expect("lock poisoned");
        match map.entry(id) {
            Entry::Occupied(_) => Ok(Insertion::AlreadyPresent),
            Entry::Vacant(slot) => {
                slot.insert(envelope.clone());
                debug!(id = %id.short_hex(), "envelope stored in memory");
                Ok(Insertion::Inserted)
            }
        }
    }

    fn exists(&self, id: &EnvelopeId) -> StoreResult<bool> {
        Ok(self.envelopes.read().expect("lock poisoned").contains_key(id))
    }

    fn ids(&self) -> StoreResult<Vec<EnvelopeId>> {
        let map = self.envelopes.read().expect("lock poisoned");
        let mut ids: Vec<EnvelopeId> = map.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.envelopes.read().expect("lock poisoned").len())
    }

    fn quarantined(&self) -> Vec<EnvelopeId> {
        // Envelopes are verified on insert and never leave memory.
        Vec::new()
    }

    fn remove(&self, ids: &[EnvelopeId]) -> StoreResult<usize> {
        let mut map = self.envelopes.write().expect("lock poisoned");
        Ok(ids.iter().filter(|id| map.remove(*id).is_some()).count())
    }
}

impl std::fmt::Debug for InMemoryEnvelopeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.envelopes.read().expect("lock poisoned").len();
        f.debug_struct("InMemoryEnvelopeStore")
            .field("envelope_count", &count)
            .finish()
    }
}
