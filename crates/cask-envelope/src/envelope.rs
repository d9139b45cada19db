use std::fmt;

use bytes::Bytes;
use cask_types::{EnvelopeId, IndexValue, Timestamp};

use crate::config::EncoderConfig;
use crate::encoder::{identity_of, CanonicalEncoder, EnvelopeDraft};
use crate::error::EnvelopeResult;
use crate::fields::{Fields, ValueRef};
use crate::layout::Layout;
use crate::relation::{RelationRef, Relations};
use crate::schema::tombstone_schema_id;
use crate::view::EnvelopeView;

/// An immutable, identified envelope backed by its stored bytes.
///
/// The bytes are the canonical layout followed by the identity. Cloning is
/// cheap: the buffer is reference counted and accessors read from it in place.
#[derive(Clone)]
pub struct Envelope {
    id: EnvelopeId,
    bytes: Bytes,
    layout: Layout,
}

impl Envelope {
    /// Start building an envelope of the given type.
    pub fn builder(type_descriptor: EnvelopeId, payload: impl Into<Bytes>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(type_descriptor, payload)
    }

    /// Decode stored bytes and verify that the trailing identity is the hash
    /// of the canonical bytes.
    pub fn decode(bytes: impl Into<Bytes>) -> EnvelopeResult<Self> {
        let envelope = Self::decode_trusted(bytes)?;
        envelope.view().verify()?;
        Ok(envelope)
    }

    /// Decode stored bytes checking structure only. For bytes whose integrity
    /// was established elsewhere.
    pub fn decode_trusted(bytes: impl Into<Bytes>) -> EnvelopeResult<Self> {
        let bytes = bytes.into();
        let view = EnvelopeView::parse(&bytes)?;
        let (id, layout) = (view.identity(), view.layout());
        Ok(Self { id, bytes, layout })
    }

    /// Hash canonical bytes and append the identity.
    fn seal(mut canonical: Vec<u8>) -> EnvelopeResult<Self> {
        let id = identity_of(&canonical);
        canonical.extend_from_slice(id.as_bytes());
        Self::decode_trusted(canonical)
    }

    pub fn view(&self) -> EnvelopeView<'_> {
        EnvelopeView::with_layout(&self.bytes, self.layout)
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn type_descriptor(&self) -> EnvelopeId {
        self.view().type_descriptor()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.view().type_name()
    }

    pub fn previous(&self) -> Option<EnvelopeId> {
        self.view().previous()
    }

    pub fn created_at(&self) -> Option<Timestamp> {
        self.view().created_at()
    }

    pub fn payload(&self) -> &[u8] {
        self.view().payload()
    }

    /// The payload as a shared slice of the stored buffer.
    pub fn payload_bytes(&self) -> Bytes {
        self.bytes
            .slice(self.layout.span(crate::layout::Section::Payload).range())
    }

    pub fn relationships(&self) -> Relations<'_> {
        self.view().relationships()
    }

    pub fn relation(&self, name: &str) -> Option<RelationRef<'_>> {
        self.view().relation(name)
    }

    /// Targets of `relation`, empty if the relation is absent.
    pub fn targets(&self, relation: &str) -> Vec<EnvelopeId> {
        self.relation(relation)
            .map(|r| r.targets().collect())
            .unwrap_or_default()
    }

    pub fn fields(&self) -> Fields<'_> {
        self.view().fields()
    }

    pub fn field(&self, name: &str) -> Option<ValueRef<'_>> {
        self.view().field(name)
    }

    pub fn is_tombstone(&self) -> bool {
        self.view().is_tombstone()
    }

    pub fn canonical_bytes(&self) -> &[u8] {
        &self.bytes[..self.layout.canonical_len()]
    }

    /// Stored bytes: canonical bytes followed by the identity.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Envelope {}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("type", &self.type_descriptor())
            .field("previous", &self.previous())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// Builder for [`Envelope`].
///
/// ```
/// use cask_envelope::EnvelopeBuilder;
/// use cask_types::EnvelopeId;
///
/// let author = EnvelopeId::from_hash([1; 32]);
/// let post = EnvelopeBuilder::new(EnvelopeId::from_hash([9; 32]), &b"hello"[..])
///     .relate("author", author)
///     .field("tags", vec!["rust", "storage"])
///     .build()
///     .unwrap();
/// assert_eq!(post.targets("author"), vec![author]);
/// ```
#[derive(Clone, Debug)]
pub struct EnvelopeBuilder {
    draft: EnvelopeDraft,
}

impl EnvelopeBuilder {
    pub fn new(type_descriptor: EnvelopeId, payload: impl Into<Bytes>) -> Self {
        Self {
            draft: EnvelopeDraft {
                type_descriptor,
                payload: payload.into(),
                ..Default::default()
            },
        }
    }

    /// A tombstone superseding `target`, marking its lineage deleted.
    pub fn tombstone(target: EnvelopeId) -> Self {
        Self::new(tombstone_schema_id(), Bytes::new()).previous(target)
    }

    pub fn type_name(mut self, name: impl Into<String>) -> Self {
        self.draft.type_name = Some(name.into());
        self
    }

    /// Add `target` under `relation`. Repeated calls with the same name
    /// accumulate into one entry.
    pub fn relate(mut self, relation: impl Into<String>, target: EnvelopeId) -> Self {
        let relation = relation.into();
        match self
            .draft
            .relationships
            .iter_mut()
            .find(|(name, _)| *name == relation)
        {
            Some((_, targets)) => targets.push(target),
            None => self.draft.relationships.push((relation, vec![target])),
        }
        self
    }

    /// Declare a relation with several targets at once. An empty iterator
    /// declares an empty relation, which fails at build time.
    pub fn relate_many(
        mut self,
        relation: impl Into<String>,
        targets: impl IntoIterator<Item = EnvelopeId>,
    ) -> Self {
        self.draft
            .relationships
            .push((relation.into(), targets.into_iter().collect()));
        self
    }

    /// Set an index field. Setting the same name twice keeps the last value.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        let (name, value) = (name.into(), value.into());
        match self
            .draft
            .index_fields
            .iter_mut()
            .find(|(existing, _)| *existing == name)
        {
            Some((_, slot)) => *slot = value,
            None => self.draft.index_fields.push((name, value)),
        }
        self
    }

    pub fn previous(mut self, previous: EnvelopeId) -> Self {
        self.draft.previous = Some(previous);
        self
    }

    pub fn created_at(mut self, at: Timestamp) -> Self {
        self.draft.created_at = Some(at);
        self
    }

    pub fn draft(&self) -> &EnvelopeDraft {
        &self.draft
    }

    /// Encode with the default configuration.
    pub fn build(self) -> EnvelopeResult<Envelope> {
        self.build_with(&EncoderConfig::default())
    }

    pub fn build_with(self, config: &EncoderConfig) -> EnvelopeResult<Envelope> {
        let canonical = CanonicalEncoder::new(config.clone()).encode(&self.draft)?;
        Envelope::seal(canonical)
    }
}

impl From<EnvelopeDraft> for EnvelopeBuilder {
    fn from(draft: EnvelopeDraft) -> Self {
        Self { draft }
    }
}
