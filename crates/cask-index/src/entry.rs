//! Index extraction: the pure half of index maintenance.
//!
//! [`IndexEntries::extract`] reads an envelope through its zero-copy view and
//! lists every index entry it contributes. Applying those entries is a
//! separate step, so extraction never touches shared state.

use std::collections::BTreeSet;

use cask_envelope::{Envelope, ValueRef};
use cask_types::{EnvelopeId, ValueKey};
use serde::{Deserialize, Serialize};

/// A reverse-reference entry: `source` points at some target under `relation`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Referrer {
    pub source: EnvelopeId,
    pub relation: String,
}

/// Everything one envelope contributes to the indexes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntries {
    pub id: EnvelopeId,
    pub type_descriptor: EnvelopeId,
    pub previous: Option<EnvelopeId>,
    /// Scalar fields, for equality lookups.
    pub exact: BTreeSet<(String, ValueKey)>,
    /// Numeric and timestamp fields, for range scans.
    pub range: BTreeSet<(String, ValueKey)>,
    /// Array elements, for tag lookups.
    pub tokens: BTreeSet<(String, ValueKey)>,
    /// `(target, relation)` for every relationship target.
    pub references: BTreeSet<(EnvelopeId, String)>,
}

impl IndexEntries {
    /// Extract the index entries of `envelope`.
    pub fn extract(envelope: &Envelope) -> Self {
        let view = envelope.view();
        let mut entries = Self {
            id: envelope.id(),
            type_descriptor: view.type_descriptor(),
            previous: view.previous(),
            exact: BTreeSet::new(),
            range: BTreeSet::new(),
            tokens: BTreeSet::new(),
            references: BTreeSet::new(),
        };

        for field in view.fields() {
            match field.value {
                ValueRef::Array(items) => {
                    for item in items {
                        if let Some(key) = item.to_value().key() {
                            entries.tokens.insert((field.name.to_string(), key));
                        }
                    }
                }
                scalar => {
                    let kind = scalar.kind();
                    if let Some(key) = scalar.to_value().key() {
                        if kind.is_rangeable() {
                            entries.range.insert((field.name.to_string(), key.clone()));
                        }
                        entries.exact.insert((field.name.to_string(), key));
                    }
                }
            }
        }

        for relation in view.relationships() {
            for target in relation.targets() {
                entries
                    .references
                    .insert((target, relation.name().to_string()));
            }
        }
        entries
    }

    /// Number of individual index entries.
    pub fn len(&self) -> usize {
        self.exact.len() + self.range.len() + self.tokens.len() + self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
