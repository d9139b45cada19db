//! Recording envelopes into lineages.
//!
//! [`LineageTracker`] drives the read / advance / compare-and-swap loop over
//! any [`LineageStore`], and rebuilds the whole table from a store scan.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use cask_envelope::Envelope;
use cask_store::{EnvelopeStore, StoreError};
use cask_types::EnvelopeId;
use tracing::{debug, info, warn};

use crate::error::{LineageError, LineageResult};
use crate::traits::LineageStore;
use crate::types::{Advance, Lineage};

/// Attempts before a contended lineage update gives up.
pub const MAX_CAS_ATTEMPTS: usize = 64;

/// Records envelopes into their lineages.
#[derive(Clone)]
pub struct LineageTracker {
    backend: Arc<dyn LineageStore>,
}

impl LineageTracker {
    pub fn new(backend: Arc<dyn LineageStore>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn LineageStore> {
        &self.backend
    }

    /// The lineage `member` belongs to.
    pub fn lineage(&self, member: &EnvelopeId) -> LineageResult<Option<Lineage>> {
        self.backend.find(member)
    }

    /// Fail if recording `id` after `previous` would repeat an identity in
    /// the chain.
    pub fn check_acyclic(&self, id: &EnvelopeId, previous: &EnvelopeId) -> LineageResult<()> {
        let cycle = id == previous
            || self
                .backend
                .find(previous)?
                .is_some_and(|lineage| lineage.chain_reaches(previous, id));
        if cycle {
            return Err(LineageError::CycleDetected {
                id: *id,
                previous: *previous,
            });
        }
        Ok(())
    }

    pub fn record_envelope(&self, envelope: &Envelope) -> LineageResult<Advance> {
        self.record(envelope.id(), envelope.previous(), envelope.is_tombstone())
    }

    /// Record `id` as the successor of `previous` (or as a new root).
    ///
    /// Idempotent: recording a member again reports
    /// [`Advance::AlreadyMember`]. A `previous` that is not tracked starts a
    /// new lineage at `id`.
    pub fn record(
        &self,
        id: EnvelopeId,
        previous: Option<EnvelopeId>,
        is_tombstone: bool,
    ) -> LineageResult<Advance> {
        if let Some(previous) = &previous {
            self.check_acyclic(&id, previous)?;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let (expected, lineage, outcome) = self.prepare(id, previous, is_tombstone)?;
            if outcome == Advance::AlreadyMember {
                return Ok(outcome);
            }
            let root = lineage.root();
            match self.backend.compare_and_swap(expected, lineage) {
                Ok(()) => {
                    match &outcome {
                        Advance::Forked { heads } => warn!(
                            id = %id.short_hex(),
                            root = %root.short_hex(),
                            heads = heads.len(),
                            "lineage forked"
                        ),
                        _ => debug!(id = %id.short_hex(), root = %root.short_hex(), "lineage advanced"),
                    }
                    return Ok(outcome);
                }
                Err(LineageError::Conflict { .. }) if attempts < MAX_CAS_ATTEMPTS => continue,
                Err(LineageError::Conflict { .. }) => {
                    return Err(LineageError::Contended { root, attempts });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn prepare(
        &self,
        id: EnvelopeId,
        previous: Option<EnvelopeId>,
        is_tombstone: bool,
    ) -> LineageResult<(Option<u64>, Lineage, Advance)> {
        let tracked = match previous {
            Some(previous) => self.backend.find(&previous)?,
            None => self.backend.read_lineage(&id)?,
        };
        match (previous, tracked) {
            (_, Some(lineage)) if lineage.contains(&id) => {
                Ok((Some(lineage.version()), lineage, Advance::AlreadyMember))
            }
            (Some(previous), Some(mut lineage)) => {
                let expected = Some(lineage.version());
                let outcome = lineage.advance(id, previous, is_tombstone);
                Ok((expected, lineage, outcome))
            }
            (previous, _) => Ok((
                None,
                Lineage::seeded(id, previous, is_tombstone),
                Advance::Started,
            )),
        }
    }

    /// Replace the table with lineages rebuilt from every envelope in
    /// `store`. Returns the number of lineages.
    ///
    /// Envelopes whose `previous` is not stored become roots of their own
    /// lineage.
    pub fn rebuild_from(&self, store: &dyn EnvelopeStore) -> LineageResult<usize> {
        let mut links: BTreeMap<EnvelopeId, (Option<EnvelopeId>, bool)> = BTreeMap::new();
        for id in store.ids()? {
            match store.read(&id) {
                Ok(Some(envelope)) => {
                    links.insert(id, (envelope.previous(), envelope.is_tombstone()));
                }
                Ok(None) => {}
                Err(
                    e @ (StoreError::HashMismatch { .. }
                    | StoreError::Quarantined(_)
                    | StoreError::Corrupt { .. }),
                ) => {
                    warn!(id = %id.short_hex(), error = %e, "skipping corrupt envelope during lineage rebuild");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut children: HashMap<EnvelopeId, Vec<EnvelopeId>> = HashMap::new();
        let mut roots = Vec::new();
        for (id, (previous, _)) in &links {
            match previous {
                Some(p) if links.contains_key(p) => children.entry(*p).or_default().push(*id),
                _ => roots.push(*id),
            }
        }

        let mut lineages = Vec::with_capacity(roots.len());
        let mut placed = 0usize;
        for root in roots {
            let (previous, tombstone) = links[&root];
            let mut lineage = Lineage::seeded(root, previous, tombstone);
            let mut queue = VecDeque::from([root]);
            while let Some(parent) = queue.pop_front() {
                for child in children.get(&parent).into_iter().flatten() {
                    lineage.advance(*child, parent, links[child].1);
                    queue.push_back(*child);
                }
            }
            placed += lineage.len();
            lineages.push(lineage);
        }
        if placed < links.len() {
            warn!(
                unplaced = links.len() - placed,
                "envelopes on a previous-cycle were left out of the lineage table"
            );
        }

        let count = lineages.len();
        self.backend.reset(lineages)?;
        info!(lineages = count, members = placed, "lineage table rebuilt from store");
        Ok(count)
    }
}

impl std::fmt::Debug for LineageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageTracker").finish_non_exhaustive()
    }
}
