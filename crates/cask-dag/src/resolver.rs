//! The version chain resolver.
//!
//! Content hashes give no forward links, so resolution reads the lineage
//! table kept by [`LineageTracker`]: heads are the members nobody supersedes,
//! and a lineage is deleted when every head reachable from a member is a
//! tombstone.

use cask_refs::{Lineage, LineageTracker};
use cask_types::EnvelopeId;
use tracing::warn;

use crate::error::{DagError, DagResult};

/// Answers head, deletion, and history queries for any lineage member.
#[derive(Clone, Debug)]
pub struct VersionResolver {
    lineages: LineageTracker,
}

impl VersionResolver {
    pub fn new(lineages: LineageTracker) -> Self {
        Self { lineages }
    }

    fn lineage(&self, id: &EnvelopeId) -> DagResult<Lineage> {
        self.lineages
            .lineage(id)?
            .ok_or(DagError::NotFound(*id))
    }

    /// Every head whose history includes `id`, sorted. More than one means
    /// the chain forked after `id`.
    pub fn heads_of(&self, id: &EnvelopeId) -> DagResult<Vec<EnvelopeId>> {
        Ok(self.lineage(id)?.heads_from(id))
    }

    /// The single head reachable from `id`.
    ///
    /// Forks are never resolved here: with several reachable heads this
    /// fails with [`DagError::ForkDetected`] listing all of them.
    pub fn head_of(&self, id: &EnvelopeId) -> DagResult<EnvelopeId> {
        let mut heads = self.heads_of(id)?;
        match heads.len() {
            1 => Ok(heads.remove(0)),
            0 => Err(DagError::NotFound(*id)),
            _ => {
                warn!(id = %id.short_hex(), heads = heads.len(), "head requested on forked lineage");
                Err(DagError::ForkDetected { id: *id, heads })
            }
        }
    }

    /// Whether every head reachable from `id` is a tombstone.
    pub fn is_deleted(&self, id: &EnvelopeId) -> DagResult<bool> {
        let lineage = self.lineage(id)?;
        let heads = lineage.heads_from(id);
        Ok(!heads.is_empty() && heads.iter().all(|head| lineage.is_tombstone(head)))
    }

    /// `id` followed by every version it supersedes, newest first.
    pub fn history(&self, id: &EnvelopeId) -> DagResult<Vec<EnvelopeId>> {
        Ok(self.lineage(id)?.history(id))
    }
}
