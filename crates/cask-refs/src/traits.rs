//! The [`LineageStore`] trait: storage for the latest-pointer-per-lineage
//! table.
//!
//! This table is the only mutable shared state in Cask. Backends serialize
//! updates per lineage through [`LineageStore::compare_and_swap`]; callers
//! read, advance, and swap, retrying when another writer got there first.

use cask_types::EnvelopeId;

use crate::error::LineageResult;
use crate::types::Lineage;

/// Storage backend for lineages.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait LineageStore: Send + Sync {
    /// Read the lineage rooted at `root`.
    fn read_lineage(&self, root: &EnvelopeId) -> LineageResult<Option<Lineage>>;

    /// Root of the lineage `member` belongs to, if it is tracked.
    fn lineage_of(&self, member: &EnvelopeId) -> LineageResult<Option<EnvelopeId>>;

    /// Replace the lineage rooted at `lineage.root()` if its stored version
    /// is still `expected` (`None`: it must not exist yet).
    ///
    /// Fails with [`LineageError::Conflict`](crate::LineageError::Conflict)
    /// otherwise, leaving the stored lineage untouched.
    fn compare_and_swap(&self, expected: Option<u64>, lineage: Lineage) -> LineageResult<()>;

    /// Roots of every tracked lineage, sorted.
    fn roots(&self) -> LineageResult<Vec<EnvelopeId>>;

    /// Replace the whole table, e.g. after a rebuild from the store.
    fn reset(&self, lineages: Vec<Lineage>) -> LineageResult<()>;

    /// Fold pending updates into the backend's compact form. A no-op for
    /// backends without one.
    fn checkpoint(&self) -> LineageResult<()> {
        Ok(())
    }

    /// The lineage `member` belongs to.
    fn find(&self, member: &EnvelopeId) -> LineageResult<Option<Lineage>> {
        match self.lineage_of(member)? {
            Some(root) => self.read_lineage(&root),
            None => Ok(None),
        }
    }

    fn is_empty(&self) -> LineageResult<bool> {
        Ok(self.roots()?.is_empty())
    }
}
