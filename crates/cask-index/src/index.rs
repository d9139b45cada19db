//! The index maintainer.
//!
//! [`EnvelopeIndex`] keeps every derived index behind one `RwLock`, so the
//! entries of a single envelope become visible all at once or not at all.
//! Indexes are never authoritative: everything here can be rebuilt from a
//! full scan of the store, and [`EnvelopeIndex::check`] /
//! [`EnvelopeIndex::repair`] detect and fix divergence by replaying
//! extraction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{Bound, RangeBounds};
use std::sync::RwLock;

use cask_envelope::{normalize_field_name, Envelope};
use cask_store::{EnvelopeStore, StoreError};
use cask_types::{EnvelopeId, IndexValue, ValueKey, ValueKind};
use tracing::{debug, info, warn};

use crate::entry::{IndexEntries, Referrer};
use crate::error::{IndexError, IndexResult};

type Buckets = BTreeMap<String, BTreeMap<ValueKey, BTreeSet<EnvelopeId>>>;

/// Full contents of every index, in deterministic order.
///
/// Two snapshots compare equal exactly when the indexes would answer every
/// query identically, which is how incremental maintenance is checked
/// against a rebuild.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub indexed: BTreeSet<EnvelopeId>,
    pub exact: Buckets,
    pub range: Buckets,
    pub inverted: Buckets,
    pub reverse: BTreeMap<EnvelopeId, BTreeSet<Referrer>>,
    pub by_type: BTreeMap<EnvelopeId, BTreeSet<EnvelopeId>>,
    pub successors: BTreeMap<EnvelopeId, BTreeSet<EnvelopeId>>,
}

#[derive(Default)]
struct IndexState {
    maps: IndexSnapshot,
    entries: HashMap<EnvelopeId, IndexEntries>,
}

impl IndexState {
    fn apply(&mut self, entries: IndexEntries) -> bool {
        let id = entries.id;
        if !self.maps.indexed.insert(id) {
            return false;
        }
        let maps = &mut self.maps;
        for (field, key) in &entries.exact {
            insert_bucket(&mut maps.exact, field, key, id);
        }
        for (field, key) in &entries.range {
            insert_bucket(&mut maps.range, field, key, id);
        }
        for (field, key) in &entries.tokens {
            insert_bucket(&mut maps.inverted, field, key, id);
        }
        for (target, relation) in &entries.references {
            maps.reverse.entry(*target).or_default().insert(Referrer {
                source: id,
                relation: relation.clone(),
            });
        }
        maps.by_type
            .entry(entries.type_descriptor)
            .or_default()
            .insert(id);
        if let Some(previous) = entries.previous {
            maps.successors.entry(previous).or_default().insert(id);
        }
        self.entries.insert(id, entries);
        true
    }

    fn remove(&mut self, id: &EnvelopeId) -> bool {
        let Some(entries) = self.entries.remove(id) else {
            return false;
        };
        let maps = &mut self.maps;
        maps.indexed.remove(id);
        for (field, key) in &entries.exact {
            remove_bucket(&mut maps.exact, field, key, id);
        }
        for (field, key) in &entries.range {
            remove_bucket(&mut maps.range, field, key, id);
        }
        for (field, key) in &entries.tokens {
            remove_bucket(&mut maps.inverted, field, key, id);
        }
        for (target, relation) in &entries.references {
            let referrer = Referrer {
                source: *id,
                relation: relation.clone(),
            };
            remove_from(&mut maps.reverse, target, &referrer);
        }
        remove_from(&mut maps.by_type, &entries.type_descriptor, id);
        if let Some(previous) = entries.previous {
            remove_from(&mut maps.successors, &previous, id);
        }
        true
    }
}

fn insert_bucket(buckets: &mut Buckets, field: &str, key: &ValueKey, id: EnvelopeId) {
    buckets
        .entry(field.to_string())
        .or_default()
        .entry(key.clone())
        .or_default()
        .insert(id);
}

fn remove_bucket(buckets: &mut Buckets, field: &str, key: &ValueKey, id: &EnvelopeId) {
    if let Some(keys) = buckets.get_mut(field) {
        remove_from(keys, key, id);
        if keys.is_empty() {
            buckets.remove(field);
        }
    }
}

/// Remove `value` from the set under `key`, pruning the set when it empties.
fn remove_from<K: Ord, V: Ord>(map: &mut BTreeMap<K, BTreeSet<V>>, key: &K, value: &V) {
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

/// Outcome of [`EnvelopeIndex::check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Stored but not indexed: repaired by replaying extraction.
    pub missing_from_index: Vec<EnvelopeId>,
    /// Indexed but not stored: the index claims an envelope the store lacks.
    pub missing_from_store: Vec<EnvelopeId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_from_index.is_empty() && self.missing_from_store.is_empty()
    }
}

/// Outcome of [`EnvelopeIndex::repair`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Identities whose entries were replayed from the store.
    pub replayed: Vec<EnvelopeId>,
    /// Identities whose stale entries were dropped.
    pub dropped: Vec<EnvelopeId>,
}

/// Exact, range, inverted, reverse-reference, type, and successor indexes
/// over a set of envelopes.
pub struct EnvelopeIndex {
    state: RwLock<IndexState>,
}

impl EnvelopeIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Number of indexed envelopes.
    pub fn len(&self) -> usize {
        self.state.read().expect("lock poisoned").maps.indexed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    /// Apply previously extracted entries. Returns `false` if the identity
    /// was already indexed, in which case nothing changes.
    pub fn apply(&self, entries: IndexEntries) -> bool {
        let id = entries.id;
        let count = entries.len();
        let applied = self.state.write().expect("lock poisoned").apply(entries);
        if applied {
            debug!(id = %id.short_hex(), entries = count, "index entries applied");
        }
        applied
    }

    /// Extract and apply in one step.
    pub fn apply_envelope(&self, envelope: &Envelope) -> bool {
        self.apply(IndexEntries::extract(envelope))
    }

    /// Drop every entry of `id`. Returns `false` if it was not indexed.
    pub fn remove(&self, id: &EnvelopeId) -> bool {
        self.state.write().expect("lock poisoned").remove(id)
    }

    /// Drop the entries of envelopes removed from the store by compaction.
    /// Returns how many were indexed.
    pub fn compact(&self, removed: &[EnvelopeId]) -> usize {
        let mut state = self.state.write().expect("lock poisoned");
        let count = removed.iter().filter(|id| state.remove(id)).count();
        info!(removed = count, remaining = state.maps.indexed.len(), "index compacted");
        count
    }

    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.state
            .read()
            .expect("lock poisoned")
            .maps
            .indexed
            .contains(id)
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Envelopes whose scalar field `field` equals `value`.
    pub fn exact(&self, field: &str, value: &IndexValue) -> IndexResult<Vec<EnvelopeId>> {
        let key = value.key().ok_or_else(|| IndexError::InvalidQuery {
            field: field.to_string(),
            reason: "arrays have no exact-match key; use a tag lookup".into(),
        })?;
        let state = self.state.read().expect("lock poisoned");
        Ok(lookup(&state.maps.exact, &normalize_field_name(field), &key))
    }

    /// Envelopes whose numeric or timestamp field falls in `range`, in value
    /// order. Both bounds must be of the same rangeable kind; at least one
    /// bound is required.
    pub fn range<R: RangeBounds<IndexValue>>(
        &self,
        field: &str,
        range: R,
    ) -> IndexResult<Vec<EnvelopeId>> {
        let invalid = |reason: String| IndexError::InvalidQuery {
            field: field.to_string(),
            reason,
        };
        let kind = match (bound_kind(range.start_bound()), bound_kind(range.end_bound())) {
            (Some(a), Some(b)) if a != b => {
                return Err(invalid(format!("range bounds mix {a} and {b}")));
            }
            (Some(kind), _) | (None, Some(kind)) => kind,
            (None, None) => return Err(invalid("range scan needs at least one bound".into())),
        };
        if !kind.is_rangeable() {
            return Err(invalid(format!("{kind} values are not range-indexed")));
        }

        let lower = key_bound(range.start_bound(), ValueKey::kind_start(kind));
        let upper = key_bound(range.end_bound(), ValueKey::kind_end(kind));
        if is_empty_range(&lower, &upper) {
            return Ok(Vec::new());
        }

        let state = self.state.read().expect("lock poisoned");
        let Some(keys) = state.maps.range.get(&normalize_field_name(field)) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .range((lower, upper))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect())
    }

    /// Envelopes whose array field `field` contains `token`.
    pub fn tagged(&self, field: &str, token: &IndexValue) -> IndexResult<Vec<EnvelopeId>> {
        let key = token.key().ok_or_else(|| IndexError::InvalidQuery {
            field: field.to_string(),
            reason: "tag lookups take a scalar token".into(),
        })?;
        let state = self.state.read().expect("lock poisoned");
        Ok(lookup(&state.maps.inverted, &normalize_field_name(field), &key))
    }

    /// Every `(source, relation)` pointing at `target`. The target need not
    /// be stored.
    pub fn referrers(&self, target: &EnvelopeId) -> Vec<Referrer> {
        self.state
            .read()
            .expect("lock poisoned")
            .maps
            .reverse
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sources pointing at `target` under `relation`.
    pub fn referrers_via(&self, target: &EnvelopeId, relation: &str) -> Vec<EnvelopeId> {
        self.state
            .read()
            .expect("lock poisoned")
            .maps
            .reverse
            .get(target)
            .map(|set| {
                set.iter()
                    .filter(|r| r.relation == relation)
                    .map(|r| r.source)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Envelopes whose type descriptor is `type_descriptor`.
    pub fn by_type(&self, type_descriptor: &EnvelopeId) -> Vec<EnvelopeId> {
        collect(&self.state.read().expect("lock poisoned").maps.by_type, type_descriptor)
    }

    /// Envelopes whose `previous` is `id`. More than one means a fork.
    pub fn successors(&self, id: &EnvelopeId) -> Vec<EnvelopeId> {
        collect(&self.state.read().expect("lock poisoned").maps.successors, id)
    }

    /// Copy of every index, for equivalence checks.
    pub fn snapshot(&self) -> IndexSnapshot {
        self.state.read().expect("lock poisoned").maps.clone()
    }

    // ---------------------------------------------------------------
    // Rebuild / consistency
    // ---------------------------------------------------------------

    /// Replace the indexes with ones built from a full scan of `store`.
    ///
    /// Envelopes the store refuses to serve because they are corrupt are
    /// skipped; any other store error aborts and leaves the current indexes
    /// untouched.
    pub fn rebuild_from(&self, store: &dyn EnvelopeStore) -> IndexResult<usize> {
        let mut fresh = IndexState::default();
        let mut skipped = 0usize;
        for id in store.ids()? {
            match read_for_index(store, &id)? {
                Some(envelope) => {
                    fresh.apply(IndexEntries::extract(&envelope));
                }
                None => skipped += 1,
            }
        }
        let indexed = fresh.maps.indexed.len();
        *self.state.write().expect("lock poisoned") = fresh;
        info!(indexed, skipped, "indexes rebuilt from store");
        Ok(indexed)
    }

    /// Compare the indexed identities with the stored ones.
    pub fn check(&self, store: &dyn EnvelopeStore) -> IndexResult<ConsistencyReport> {
        let stored: BTreeSet<EnvelopeId> = store.ids()?.into_iter().collect();
        let quarantined: BTreeSet<EnvelopeId> = store.quarantined().into_iter().collect();
        let state = self.state.read().expect("lock poisoned");
        let indexed = &state.maps.indexed;
        Ok(ConsistencyReport {
            missing_from_index: stored
                .difference(indexed)
                .filter(|id| !quarantined.contains(id))
                .copied()
                .collect(),
            missing_from_store: indexed.difference(&stored).copied().collect(),
        })
    }

    /// Bring the indexes back in line with `store`.
    ///
    /// Stored envelopes missing from the index are replayed; entries for
    /// envelopes the store no longer has are dropped. Fails for the first
    /// identity whose replay cannot be completed.
    pub fn repair(&self, store: &dyn EnvelopeStore) -> IndexResult<RepairReport> {
        let report = self.check(store)?;
        let mut repaired = RepairReport::default();

        for id in report.missing_from_index {
            let envelope = store
                .read(&id)
                .map_err(|e| IndexError::ReplayFailed {
                    id,
                    reason: e.to_string(),
                })?
                .ok_or_else(|| IndexError::ReplayFailed {
                    id,
                    reason: "envelope vanished from the store during repair".into(),
                })?;
            warn!(id = %id.short_hex(), "replaying index entries for unindexed envelope");
            self.apply_envelope(&envelope);
            repaired.replayed.push(id);
        }

        for id in report.missing_from_store {
            warn!(id = %id.short_hex(), "dropping index entries for envelope absent from store");
            self.remove(&id);
            repaired.dropped.push(id);
        }
        Ok(repaired)
    }
}

impl Default for EnvelopeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EnvelopeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeIndex")
            .field("indexed", &self.len())
            .finish()
    }
}

fn read_for_index(store: &dyn EnvelopeStore, id: &EnvelopeId) -> IndexResult<Option<Envelope>> {
    match store.read(id) {
        Ok(envelope) => Ok(envelope),
        Err(
            e @ (StoreError::HashMismatch { .. }
            | StoreError::Quarantined(_)
            | StoreError::Corrupt { .. }),
        ) => {
            warn!(id = %id.short_hex(), error = %e, "skipping corrupt envelope during rebuild");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// `BTreeMap::range` panics on inverted bounds; such ranges are simply empty.
fn is_empty_range(lower: &Bound<ValueKey>, upper: &Bound<ValueKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi)) => {
            lo >= hi
        }
        _ => false,
    }
}

fn lookup(buckets: &Buckets, field: &str, key: &ValueKey) -> Vec<EnvelopeId> {
    buckets
        .get(field)
        .and_then(|keys| keys.get(key))
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

fn collect(map: &BTreeMap<EnvelopeId, BTreeSet<EnvelopeId>>, key: &EnvelopeId) -> Vec<EnvelopeId> {
    map.get(key)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

fn bound_kind(bound: Bound<&IndexValue>) -> Option<ValueKind> {
    match bound {
        Bound::Included(v) | Bound::Excluded(v) => Some(v.kind()),
        Bound::Unbounded => None,
    }
}

fn key_bound(bound: Bound<&IndexValue>, open: ValueKey) -> Bound<ValueKey> {
    match bound {
        Bound::Included(v) => v.key().map_or(Bound::Included(open.clone()), Bound::Included),
        Bound::Excluded(v) => v.key().map_or(Bound::Included(open.clone()), Bound::Excluded),
        Bound::Unbounded => Bound::Excluded(open),
    }
}
