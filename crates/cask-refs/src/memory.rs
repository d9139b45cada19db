//! In-memory lineage table.
//!
//! [`InMemoryLineageStore`] keeps every lineage in a `HashMap` behind a
//! single `RwLock`, together with a member-to-root map so any member can find
//! its lineage in one lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use cask_types::EnvelopeId;

use crate::error::{LineageError, LineageResult};
use crate::traits::LineageStore;
use crate::types::{Lineage, LineageDelta};

#[derive(Default)]
struct Table {
    lineages: HashMap<EnvelopeId, Lineage>,
    roots: HashMap<EnvelopeId, EnvelopeId>,
}

impl Table {
    fn install(&mut self, lineage: Lineage) {
        let root = lineage.root();
        for member in lineage.members() {
            self.roots.entry(member).or_insert(root);
        }
        self.lineages.insert(root, lineage);
    }
}

/// An in-memory implementation of [`LineageStore`].
///
/// Data is lost when the store is dropped; see
/// [`FileLineageStore`](crate::FileLineageStore) for a persisted table.
#[derive(Default)]
pub struct InMemoryLineageStore {
    table: RwLock<Table>,
}

impl InMemoryLineageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table pre-populated with `lineages`.
    pub fn with_lineages(lineages: Vec<Lineage>) -> Self {
        let mut table = Table::default();
        for lineage in lineages {
            table.install(lineage);
        }
        Self {
            table: RwLock::new(table),
        }
    }

    /// Every lineage, ordered by root.
    pub fn snapshot(&self) -> Vec<Lineage> {
        let table = self.table.read().expect("lock poisoned");
        let mut lineages: Vec<Lineage> = table.lineages.values().cloned().collect();
        lineages.sort_by_key(Lineage::root);
        lineages
    }

    /// Number of lineages.
    pub fn lineage_count(&self) -> usize {
        self.table.read().expect("lock poisoned").lineages.len()
    }

    /// Apply a journaled delta without a version check.
    pub(crate) fn absorb(&self, delta: LineageDelta) {
        let mut table = self.table.write().expect("lock poisoned");
        let base = table.lineages.remove(&delta.root());
        table.install(delta.apply(base));
    }
}

impl LineageStore for InMemoryLineageStore {
    fn read_lineage(&self, root: &EnvelopeId) -> LineageResult<Option<Lineage>> {
        let table = self.table.read().expect("lock poisoned");
        Ok(table.lineages.get(root).cloned())
    }

    fn lineage_of(&self, member: &EnvelopeId) -> LineageResult<Option<EnvelopeId>> {
        let table = self.table.read().expect("lock poisoned");
        Ok(table.roots.get(member).copied())
    }

    fn compare_and_swap(&self, expected: Option<u64>, lineage: Lineage) -> LineageResult<()> {
        let mut table = self.table.write().expect("lock poisoned");
        let root = lineage.root();
        let actual = table.lineages.get(&root).map(Lineage::version);
        if actual != expected {
            return Err(LineageError::Conflict {
                root,
                expected,
                actual,
            });
        }
        table.install(lineage);
        Ok(())
    }

    fn roots(&self) -> LineageResult<Vec<EnvelopeId>> {
        let table = self.table.read().expect("lock poisoned");
        let mut roots: Vec<EnvelopeId> = table.lineages.keys().copied().collect();
        roots.sort();
        Ok(roots)
    }

    fn reset(&self, lineages: Vec<Lineage>) -> LineageResult<()> {
        let mut fresh = Table::default();
        for lineage in lineages {
            fresh.install(lineage);
        }
        *self.table.write().expect("lock poisoned") = fresh;
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryLineageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read().expect("lock poisoned");
        f.debug_struct("InMemoryLineageStore")
            .field("lineages", &table.lineages.len())
            .field("members", &table.roots.len())
            .finish()
    }
}
