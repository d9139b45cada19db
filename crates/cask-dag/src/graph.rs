//! Relationship graph traversal.
//!
//! Forward edges come straight from stored envelopes; reverse edges come from
//! the reverse-reference index, since envelopes carry no back-references.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use cask_envelope::{is_reserved, Envelope, Relationship};
use cask_index::{EnvelopeIndex, Referrer};
use cask_store::EnvelopeStore;
use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DagError, DagResult};

/// Result of a forward closure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    /// Stored envelopes reached, in breadth-first order.
    pub visited: Vec<EnvelopeId>,
    /// Referenced identities that are not stored (yet).
    pub missing: Vec<EnvelopeId>,
}

impl Reachability {
    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.visited.contains(id)
    }
}

/// Forward and reverse edge queries over a store and its indexes.
#[derive(Clone)]
pub struct RelationshipGraph {
    store: Arc<dyn EnvelopeStore>,
    index: Arc<EnvelopeIndex>,
}

impl RelationshipGraph {
    pub fn new(store: Arc<dyn EnvelopeStore>, index: Arc<EnvelopeIndex>) -> Self {
        Self { store, index }
    }

    fn envelope(&self, id: &EnvelopeId) -> DagResult<Envelope> {
        self.store.read(id)?.ok_or(DagError::NotFound(*id))
    }

    /// What `id` points to under `relation`. Empty if it has no such
    /// relation.
    pub fn targets(&self, id: &EnvelopeId, relation: &str) -> DagResult<Vec<EnvelopeId>> {
        Ok(self.envelope(id)?.targets(relation))
    }

    /// Every relationship of `id`, sorted by relation name.
    pub fn relations(&self, id: &EnvelopeId) -> DagResult<Vec<Relationship>> {
        Ok(self
            .envelope(id)?
            .relationships()
            .map(|r| r.to_relationship())
            .collect())
    }

    /// What points to `target`. Answered from the index alone, so `target`
    /// itself need not be stored.
    pub fn referrers(&self, target: &EnvelopeId) -> Vec<Referrer> {
        self.index.referrers(target)
    }

    /// Everything reachable from `roots` through relationships, `previous`
    /// links, and type descriptors. Built-in schemas are not envelopes and
    /// are never reported.
    pub fn reachable_from(&self, roots: &[EnvelopeId]) -> DagResult<Reachability> {
        let mut seen: HashSet<EnvelopeId> = HashSet::new();
        let mut queue: VecDeque<EnvelopeId> = VecDeque::new();
        for root in roots {
            if !is_reserved(root) && seen.insert(*root) {
                queue.push_back(*root);
            }
        }

        let mut result = Reachability::default();
        while let Some(current) = queue.pop_front() {
            let Some(envelope) = self.store.read(&current)? else {
                result.missing.push(current);
                continue;
            };
            result.visited.push(current);

            let edges = envelope
                .relationships()
                .flat_map(|r| r.targets())
                .chain(envelope.previous())
                .chain(Some(envelope.type_descriptor()));
            for next in edges {
                if !is_reserved(&next) && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        debug!(
            roots = roots.len(),
            visited = result.visited.len(),
            missing = result.missing.len(),
            "reachability computed"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for RelationshipGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipGraph")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
