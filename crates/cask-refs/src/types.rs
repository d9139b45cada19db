//! The lineage record: every known member of one version chain and its heads.
//!
//! Content hashes only link backwards (`previous`), so the forward view of a
//! chain has to be kept separately. A [`Lineage`] is keyed by its root and
//! stores, for each member, the member it supersedes. Heads are the members
//! nobody supersedes yet; more than one head means the chain has forked.

use std::collections::{BTreeMap, BTreeSet};

use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};

/// Outcome of recording one envelope into its lineage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advance {
    /// The envelope starts a new lineage.
    Started,
    /// The envelope superseded the head `previous`.
    Extended { previous: EnvelopeId },
    /// `previous` already had a successor; the lineage now has several heads.
    Forked { heads: Vec<EnvelopeId> },
    /// The envelope was already recorded.
    AlreadyMember,
}

impl Advance {
    pub fn is_fork(&self) -> bool {
        matches!(self, Advance::Forked { .. })
    }
}

/// One version chain, keyed by its root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LineageRecord", into = "LineageRecord")]
pub struct Lineage {
    root: EnvelopeId,
    version: u64,
    /// member -> the member it supersedes
    members: BTreeMap<EnvelopeId, Option<EnvelopeId>>,
    heads: BTreeSet<EnvelopeId>,
    tombstones: BTreeSet<EnvelopeId>,
}

impl Lineage {
    /// A lineage holding only its root.
    pub fn new(root: EnvelopeId, is_tombstone: bool) -> Self {
        Self::seeded(root, None, is_tombstone)
    }

    /// A lineage whose root supersedes an envelope that is not tracked.
    pub(crate) fn seeded(root: EnvelopeId, previous: Option<EnvelopeId>, is_tombstone: bool) -> Self {
        let mut lineage = Self {
            root,
            version: 0,
            members: BTreeMap::from([(root, previous)]),
            heads: BTreeSet::from([root]),
            tombstones: BTreeSet::new(),
        };
        if is_tombstone {
            lineage.tombstones.insert(root);
        }
        lineage
    }

    pub fn root(&self) -> EnvelopeId {
        self.root
    }

    /// Bumped by every successful advance; compared by compare-and-swap.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn heads(&self) -> &BTreeSet<EnvelopeId> {
        &self.heads
    }

    pub fn is_forked(&self) -> bool {
        self.heads.len() > 1
    }

    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.members.contains_key(id)
    }

    /// The member `id` supersedes. `None` if `id` is not a member.
    pub fn previous_of(&self, id: &EnvelopeId) -> Option<Option<EnvelopeId>> {
        self.members.get(id).copied()
    }

    pub fn is_tombstone(&self, id: &EnvelopeId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = EnvelopeId> + '_ {
        self.members.keys().copied()
    }

    /// Whether walking back from `from` reaches `target`.
    pub fn chain_reaches(&self, from: &EnvelopeId, target: &EnvelopeId) -> bool {
        let mut current = Some(*from);
        // A chain cannot be longer than the member count.
        for _ in 0..=self.members.len() {
            match current {
                Some(id) if id == *target => return true,
                Some(id) => current = self.members.get(&id).copied().flatten(),
                None => return false,
            }
        }
        false
    }

    /// Heads whose history includes `member`.
    pub fn heads_from(&self, member: &EnvelopeId) -> Vec<EnvelopeId> {
        if !self.contains(member) {
            return Vec::new();
        }
        self.heads
            .iter()
            .filter(|head| self.chain_reaches(head, member))
            .copied()
            .collect()
    }

    /// `member` followed by every member it transitively supersedes.
    pub fn history(&self, member: &EnvelopeId) -> Vec<EnvelopeId> {
        let mut chain = Vec::new();
        let mut current = Some(*member);
        while let Some(id) = current.filter(|id| self.contains(id)) {
            if chain.len() >= self.members.len() {
                break;
            }
            chain.push(id);
            current = self.members.get(&id).copied().flatten();
        }
        chain
    }

    /// Record `id` as superseding `previous`, which must be a member.
    pub(crate) fn advance(
        &mut self,
        id: EnvelopeId,
        previous: EnvelopeId,
        is_tombstone: bool,
    ) -> Advance {
        if self.contains(&id) {
            return Advance::AlreadyMember;
        }
        self.members.insert(id, Some(previous));
        if is_tombstone {
            self.tombstones.insert(id);
        }
        self.version += 1;

        let replaced = self.heads.remove(&previous);
        self.heads.insert(id);
        if replaced {
            Advance::Extended { previous }
        } else {
            Advance::Forked {
                heads: self.heads.iter().copied().collect(),
            }
        }
    }
}

/// Members a lineage gained between two versions.
///
/// Lineages only ever grow, so a journal of deltas replays to the same table
/// as a full snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LineageDelta {
    root: EnvelopeId,
    version: u64,
    members: Vec<MemberRecord>,
}

impl LineageDelta {
    /// What `lineage` adds on top of `base`, the stored version of the same
    /// lineage (`None`: not stored yet).
    pub(crate) fn between(base: Option<&Lineage>, lineage: &Lineage) -> Self {
        let members = lineage
            .members
            .iter()
            .filter(|(id, _)| !base.is_some_and(|b| b.contains(id)))
            .map(|(id, previous)| MemberRecord {
                id: *id,
                previous: *previous,
                tombstone: lineage.tombstones.contains(id),
            })
            .collect();
        Self {
            root: lineage.root,
            version: lineage.version,
            members,
        }
    }

    pub(crate) fn root(&self) -> EnvelopeId {
        self.root
    }

    /// Apply on top of `base`. A delta not newer than `base` was already
    /// applied and leaves it unchanged.
    pub(crate) fn apply(self, base: Option<Lineage>) -> Lineage {
        let mut lineage = match base {
            Some(base) if base.version >= self.version => return base,
            Some(base) => base,
            None => Lineage {
                root: self.root,
                version: self.version,
                members: BTreeMap::new(),
                heads: BTreeSet::new(),
                tombstones: BTreeSet::new(),
            },
        };
        let added: Vec<&MemberRecord> = self
            .members
            .iter()
            .filter(|m| !lineage.members.contains_key(&m.id))
            .collect();
        for member in &added {
            lineage.members.insert(member.id, member.previous);
            lineage.heads.insert(member.id);
            if member.tombstone {
                lineage.tombstones.insert(member.id);
            }
        }
        for member in &added {
            if let Some(previous) = member.previous.filter(|_| member.id != lineage.root) {
                lineage.heads.remove(&previous);
            }
        }
        lineage.version = self.version;
        lineage
    }
}

/// Serialized form. Heads are derived, so they are not stored.
#[derive(Serialize, Deserialize)]
struct LineageRecord {
    root: EnvelopeId,
    version: u64,
    members: Vec<MemberRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct MemberRecord {
    id: EnvelopeId,
    previous: Option<EnvelopeId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    tombstone: bool,
}

impl From<Lineage> for LineageRecord {
    fn from(lineage: Lineage) -> Self {
        let members = lineage
            .members
            .iter()
            .map(|(id, previous)| MemberRecord {
                id: *id,
                previous: *previous,
                tombstone: lineage.tombstones.contains(id),
            })
            .collect();
        LineageRecord {
            root: lineage.root,
            version: lineage.version,
            members,
        }
    }
}

impl From<LineageRecord> for Lineage {
    fn from(record: LineageRecord) -> Self {
        let members: BTreeMap<EnvelopeId, Option<EnvelopeId>> = record
            .members
            .iter()
            .map(|m| (m.id, m.previous))
            .collect();
        let superseded: BTreeSet<EnvelopeId> = members
            .iter()
            .filter(|(id, _)| **id != record.root)
            .filter_map(|(_, previous)| *previous)
            .collect();
        let heads = members
            .keys()
            .filter(|id| !superseded.contains(id))
            .copied()
            .collect();
        let tombstones = record
            .members
            .iter()
            .filter(|m| m.tombstone)
            .map(|m| m.id)
            .collect();
        Lineage {
            root: record.root,
            version: record.version,
            members,
            heads,
            tombstones,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> EnvelopeId {
        EnvelopeId::from_hash([n; 32])
    }

    // ---- linear chain ----

    #[test]
    fn linear_chain_moves_head() {
        let mut lineage = Lineage::new(id(1), false);
        assert_eq!(lineage.heads().iter().copied().collect::<Vec<_>>(), vec![id(1)]);

        assert_eq!(
            lineage.advance(id(2), id(1), false),
            Advance::Extended { previous: id(1) }
        );
        assert_eq!(
            lineage.advance(id(3), id(2), false),
            Advance::Extended { previous: id(2) }
        );
        assert_eq!(lineage.version(), 2);
        assert_eq!(lineage.heads_from(&id(1)), vec![id(3)]);
        assert_eq!(lineage.history(&id(3)), vec![id(3), id(2), id(1)]);
        assert!(!lineage.is_forked());
    }

    #[test]
    fn re_advancing_a_member_changes_nothing() {
        let mut lineage = Lineage::new(id(1), false);
        lineage.advance(id(2), id(1), false);
        let before = lineage.clone();
        assert_eq!(lineage.advance(id(2), id(1), false), Advance::AlreadyMember);
        assert_eq!(lineage, before);
    }

    // ---- forks ----

    #[test]
    fn second_successor_forks() {
        let mut lineage = Lineage::new(id(1), false);
        lineage.advance(id(2), id(1), false);
        let outcome = lineage.advance(id(3), id(1), false);
        assert!(outcome.is_fork());
        assert_eq!(outcome, Advance::Forked { heads: vec![id(2), id(3)] });
        assert!(lineage.is_forked());

        // Each branch only sees its own head.
        lineage.advance(id(4), id(2), false);
        assert_eq!(lineage.heads_from(&id(2)), vec![id(4)]);
        assert_eq!(lineage.heads_from(&id(3)), vec![id(3)]);
        assert_eq!(lineage.heads_from(&id(1)), vec![id(3), id(4)]);
    }

    #[test]
    fn tombstones_are_tracked() {
        let mut lineage = Lineage::new(id(1), false);
        lineage.advance(id(2), id(1), true);
        assert!(lineage.is_tombstone(&id(2)));
        assert!(!lineage.is_tombstone(&id(1)));
    }

    #[test]
    fn chain_reaches_follows_previous() {
        let mut lineage = Lineage::new(id(1), false);
        lineage.advance(id(2), id(1), false);
        assert!(lineage.chain_reaches(&id(2), &id(1)));
        assert!(!lineage.chain_reaches(&id(1), &id(2)));
        assert!(lineage.heads_from(&id(9)).is_empty());
        assert!(lineage.history(&id(9)).is_empty());
    }

    // ---- serialization ----

    #[test]
    fn json_roundtrip_rederives_heads() {
        let mut lineage = Lineage::new(id(1), false);
        lineage.advance(id(2), id(1), false);
        lineage.advance(id(3), id(1), true);

        let json = serde_json::to_string(&lineage).unwrap();
        let parsed: Lineage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, lineage);
        assert_eq!(parsed.heads().len(), 2);
        assert!(parsed.is_tombstone(&id(3)));
    }

    #[test]
    fn seeded_root_keeps_its_previous() {
        let lineage = Lineage::seeded(id(5), Some(id(4)), false);
        assert_eq!(lineage.previous_of(&id(5)), Some(Some(id(4))));
        let json = serde_json::to_string(&lineage).unwrap();
        let parsed: Lineage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.heads().iter().copied().collect::<Vec<_>>(), vec![id(5)]);
    }

    // ---- deltas ----

    #[test]
    fn deltas_replay_to_the_same_lineage() {
        let mut steps = vec![Lineage::new(id(1), false)];
        for (next, previous, tomb) in [(2, 1, false), (3, 1, false), (4, 3, true)] {
            let mut lineage = steps.last().unwrap().clone();
            lineage.advance(id(next), id(previous), tomb);
            steps.push(lineage);
        }

        let mut replayed: Option<Lineage> = None;
        let mut base: Option<&Lineage> = None;
        for step in &steps {
            let delta = LineageDelta::between(base, step);
            assert_eq!(delta.members.len(), 1);
            replayed = Some(delta.apply(replayed));
            base = Some(step);
        }
        let replayed = replayed.unwrap();
        assert_eq!(&replayed, steps.last().unwrap());
        assert_eq!(
            replayed.heads().iter().copied().collect::<BTreeSet<_>>(),
            BTreeSet::from([id(2), id(4)])
        );
    }

    #[test]
    fn stale_delta_is_ignored() {
        let v0 = Lineage::new(id(1), false);
        let mut v1 = v0.clone();
        v1.advance(id(2), id(1), false);

        let again = LineageDelta::between(None, &v0).apply(Some(v1.clone()));
        assert_eq!(again, v1);
        let again = LineageDelta::between(Some(&v0), &v1).apply(Some(v1.clone()));
        assert_eq!(again, v1);
    }
}
