use cask_refs::Advance;
use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};

/// Result of a put operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutReceipt {
    pub id: EnvelopeId,
    /// The envelope was already stored; nothing new was written.
    pub deduplicated: bool,
    /// How the envelope moved its lineage.
    pub advance: Advance,
}

impl PutReceipt {
    /// Every head of the lineage, if this put forked it.
    pub fn forked_heads(&self) -> Option<&[EnvelopeId]> {
        match &self.advance {
            Advance::Forked { heads } => Some(heads),
            _ => None,
        }
    }
}

/// Summary of a compaction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    /// Superseded envelopes removed from the store and indexes.
    pub removed: Vec<EnvelopeId>,
    /// Superseded envelopes kept because something still references them.
    pub retained: Vec<EnvelopeId>,
}
