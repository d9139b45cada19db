//! Relationships: named, directed, possibly multi-valued forward edges.
//!
//! Envelopes only carry forward edges. "What points to X?" is answered by the
//! reverse-reference index, never by scanning envelopes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::slice::ChunksExact;

use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};

use crate::error::{EnvelopeError, EnvelopeResult};
use crate::layout::{self, EntryTable, Reader};

/// An owned relationship entry.
///
/// `targets` is sorted and free of duplicates when produced by this crate.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub targets: Vec<EnvelopeId>,
}

/// A relationship entry borrowed from canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RelationRef<'a> {
    name: &'a str,
    targets: &'a [u8],
}

impl<'a> RelationRef<'a> {
    /// The relation name.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len() / EnvelopeId::LEN
    }

    /// Always `false` for entries read from valid bytes.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Targets in ascending identity order.
    pub fn targets(&self) -> Targets<'a> {
        Targets {
            chunks: self.targets.chunks_exact(EnvelopeId::LEN),
        }
    }

    /// Whether `target` is one of this entry's targets.
    pub fn contains(&self, target: &EnvelopeId) -> bool {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let start = mid * EnvelopeId::LEN;
            let probe = &self.targets[start..start + EnvelopeId::LEN];
            match probe.cmp(target.as_bytes().as_slice()) {
                std::cmp::Ordering::Equal => return true,
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        false
    }

    pub fn to_relationship(self) -> Relationship {
        Relationship {
            name: self.name.to_string(),
            targets: self.targets().collect(),
        }
    }
}

impl fmt::Debug for RelationRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationRef")
            .field("name", &self.name)
            .field("targets", &self.targets().collect::<Vec<_>>())
            .finish()
    }
}

/// Iterator over the targets of one relation.
#[derive(Clone)]
pub struct Targets<'a> {
    chunks: ChunksExact<'a, u8>,
}

impl Iterator for Targets<'_> {
    type Item = EnvelopeId;

    fn next(&mut self) -> Option<EnvelopeId> {
        let chunk = self.chunks.next()?;
        EnvelopeId::from_slice(chunk).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Targets<'_> {}

/// Iterator over relation entries in name order.
#[derive(Clone)]
pub struct Relations<'a> {
    table: EntryTable<'a>,
    next: usize,
}

impl<'a> Relations<'a> {
    pub(crate) fn new(table: EntryTable<'a>) -> Self {
        Self { table, next: 0 }
    }

    pub(crate) fn find(table: EntryTable<'a>, name: &str) -> Option<RelationRef<'a>> {
        let (name, mut reader) = table.find(name)?;
        read_targets(&mut reader, name).ok()
    }
}

impl<'a> Iterator for Relations<'a> {
    type Item = RelationRef<'a>;

    fn next(&mut self) -> Option<RelationRef<'a>> {
        let mut reader = self.table.entry(self.next)?;
        self.next += 1;
        let name = reader.name().ok()?;
        read_targets(&mut reader, name).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.table.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

fn read_targets<'a>(r: &mut Reader<'a>, name: &'a str) -> EnvelopeResult<RelationRef<'a>> {
    let count = r.u32()? as usize;
    let len = count
        .checked_mul(EnvelopeId::LEN)
        .ok_or_else(|| EnvelopeError::malformed(r.offset(), "target count overflows"))?;
    let targets = r.take(len)?;
    Ok(RelationRef { name, targets })
}

/// Validate the relations section. Names must be strictly ascending and every
/// target set non-empty, strictly ascending, and thus duplicate-free.
pub(crate) fn validate_section(section: &[u8], base: usize) -> EnvelopeResult<usize> {
    let mut previous_name: Option<&str> = None;
    layout::validate_entries(section, base, |r, _| {
        let at = r.offset();
        let name = r.name()?;
        if previous_name.is_some_and(|prev| prev >= name) {
            return Err(EnvelopeError::malformed(
                at,
                format!("relation {name:?} is out of order"),
            ));
        }
        previous_name = Some(name);

        let entry = read_targets(r, name)?;
        if entry.is_empty() {
            return Err(EnvelopeError::malformed(
                at,
                format!("relation {name:?} has no targets"),
            ));
        }
        let mut prior: Option<&[u8]> = None;
        for chunk in entry.targets.chunks_exact(EnvelopeId::LEN) {
            if prior.is_some_and(|p| p >= chunk) {
                return Err(EnvelopeError::malformed(
                    at,
                    format!("targets of relation {name:?} are not strictly ascending"),
                ));
            }
            prior = Some(chunk);
        }
        Ok(())
    })
}

/// Merge declared relationships into canonical order, rejecting empty
/// target sets and unusable names.
pub(crate) fn canonicalize<'d>(
    declared: &'d [(String, Vec<EnvelopeId>)],
) -> EnvelopeResult<BTreeMap<&'d str, BTreeSet<EnvelopeId>>> {
    let mut merged: BTreeMap<&str, BTreeSet<EnvelopeId>> = BTreeMap::new();
    for (name, targets) in declared {
        if name.is_empty() {
            return Err(EnvelopeError::InvalidName {
                name: name.clone(),
                reason: "relation name is empty".into(),
            });
        }
        if name.len() > layout::MAX_NAME_LEN {
            return Err(EnvelopeError::InvalidName {
                name: name.clone(),
                reason: format!("longer than {} bytes", layout::MAX_NAME_LEN),
            });
        }
        if targets.is_empty() {
            return Err(EnvelopeError::EmptyRelation {
                relation: name.clone(),
            });
        }
        merged
            .entry(name.as_str())
            .or_default()
            .extend(targets.iter().copied());
    }
    Ok(merged)
}

pub(crate) fn encode_section(
    relations: &BTreeMap<&str, BTreeSet<EnvelopeId>>,
    out: &mut Vec<u8>,
) -> EnvelopeResult<()> {
    let mut entries = Vec::with_capacity(relations.len());
    for (name, targets) in relations {
        let mut entry = Vec::with_capacity(1 + name.len() + 4 + targets.len() * EnvelopeId::LEN);
        layout::put_name(&mut entry, name);
        entry.extend_from_slice(&layout::to_u32(targets.len())?.to_be_bytes());
        for target in targets {
            entry.extend_from_slice(target.as_bytes());
        }
        entries.push(entry);
    }
    layout::write_entries(out, &entries)
}
