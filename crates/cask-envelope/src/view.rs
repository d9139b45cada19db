//! Zero-copy access to stored envelope bytes.

use std::fmt;

use cask_types::{EnvelopeId, Timestamp};

use crate::encoder::identity_of;
use crate::error::{EnvelopeError, EnvelopeResult};
use crate::fields::{self, Fields, ValueRef};
use crate::layout::{EntryTable, Layout, Reader, Section, MAX_NAME_LEN, TYPE_DESCRIPTOR_RANGE};
use crate::relation::{self, RelationRef, Relations};
use crate::schema::tombstone_schema_id;

/// Borrowed, validated view over stored envelope bytes.
///
/// Every accessor reads straight from the underlying slice through the
/// section table; nothing is decoded up front and the payload is never
/// touched unless asked for.
#[derive(Clone, Copy)]
pub struct EnvelopeView<'a> {
    bytes: &'a [u8],
    layout: Layout,
}

impl<'a> EnvelopeView<'a> {
    /// Validate the structure of stored bytes (canonical bytes followed by
    /// the identity). The identity is not checked against the hash; see
    /// [`EnvelopeView::verify`].
    pub fn parse(stored: &'a [u8]) -> EnvelopeResult<Self> {
        let mut layout = Layout::read_frame(stored)?;

        let span = layout.span(Section::TypeName);
        if span.len > MAX_NAME_LEN {
            return Err(EnvelopeError::malformed(span.offset, "type name too long"));
        }
        Reader::new(&stored[span.range()], span.offset).str(span.len)?;

        let span = layout.span(Section::Relations);
        layout.relation_count = relation::validate_section(&stored[span.range()], span.offset)?;

        let span = layout.span(Section::Fields);
        layout.field_count = fields::validate_section(&stored[span.range()], span.offset)?;

        let span = layout.span(Section::Previous);
        if span.len != 0 && span.len != EnvelopeId::LEN {
            return Err(EnvelopeError::malformed(
                span.offset,
                format!("previous section of {} bytes", span.len),
            ));
        }
        let span = layout.span(Section::CreatedAt);
        if span.len != 0 && span.len != 8 {
            return Err(EnvelopeError::malformed(
                span.offset,
                format!("created_at section of {} bytes", span.len),
            ));
        }

        let view = Self {
            bytes: stored,
            layout,
        };
        if view.is_tombstone() && view.previous().is_none() {
            return Err(EnvelopeError::TombstoneWithoutTarget);
        }
        Ok(view)
    }

    /// Pair bytes with a layout previously produced by [`EnvelopeView::parse`]
    /// on the same bytes.
    pub(crate) fn with_layout(bytes: &'a [u8], layout: Layout) -> Self {
        Self { bytes, layout }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    fn section(&self, section: Section) -> &'a [u8] {
        self.bytes
            .get(self.layout.span(section).range())
            .unwrap_or_default()
    }

    fn table(&self, section: Section, count: usize) -> EntryTable<'a> {
        EntryTable::new(self.section(section), self.layout.span(section).offset, count)
    }

    /// The hashed prefix.
    pub fn canonical_bytes(&self) -> &'a [u8] {
        &self.bytes[..self.layout.canonical_len()]
    }

    /// The full stored bytes, identity included.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Identity as recorded in the trailer.
    pub fn identity(&self) -> EnvelopeId {
        EnvelopeId::from_slice(&self.bytes[self.layout.canonical_len()..]).unwrap_or_default()
    }

    /// Identity recomputed from the canonical bytes.
    pub fn computed_identity(&self) -> EnvelopeId {
        identity_of(self.canonical_bytes())
    }

    /// Check the trailer against the hash of the canonical bytes.
    pub fn verify(&self) -> EnvelopeResult<EnvelopeId> {
        let stored = self.identity();
        let computed = self.computed_identity();
        if stored != computed {
            return Err(EnvelopeError::HashMismatch { stored, computed });
        }
        Ok(stored)
    }

    pub fn type_descriptor(&self) -> EnvelopeId {
        EnvelopeId::from_slice(&self.bytes[TYPE_DESCRIPTOR_RANGE]).unwrap_or_default()
    }

    pub fn type_name(&self) -> Option<&'a str> {
        let raw = self.section(Section::TypeName);
        if raw.is_empty() {
            return None;
        }
        std::str::from_utf8(raw).ok()
    }

    pub fn previous(&self) -> Option<EnvelopeId> {
        EnvelopeId::from_slice(self.section(Section::Previous)).ok()
    }

    /// Creator-supplied timestamp. Untrusted metadata.
    pub fn created_at(&self) -> Option<Timestamp> {
        let raw: [u8; 8] = self.section(Section::CreatedAt).try_into().ok()?;
        Some(Timestamp::from_millis(i64::from_be_bytes(raw)))
    }

    pub fn payload(&self) -> &'a [u8] {
        self.section(Section::Payload)
    }

    /// Relation entries in name order.
    pub fn relationships(&self) -> Relations<'a> {
        Relations::new(self.table(Section::Relations, self.layout.relation_count))
    }

    /// Binary search for one relation.
    pub fn relation(&self, name: &str) -> Option<RelationRef<'a>> {
        Relations::find(self.table(Section::Relations, self.layout.relation_count), name)
    }

    /// Index fields in normalized-name order.
    pub fn fields(&self) -> Fields<'a> {
        Fields::new(self.table(Section::Fields, self.layout.field_count))
    }

    /// Binary search for one field; `name` is normalized first.
    pub fn field(&self, name: &str) -> Option<ValueRef<'a>> {
        Fields::find(self.table(Section::Fields, self.layout.field_count), name)
    }

    pub fn is_tombstone(&self) -> bool {
        self.type_descriptor() == tombstone_schema_id()
    }
}

impl fmt::Debug for EnvelopeView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeView")
            .field("id", &self.identity())
            .field("type", &self.type_descriptor())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HEADER_LEN;
    use crate::EnvelopeBuilder;
    use cask_types::IndexValue;

    fn sample() -> Vec<u8> {
        EnvelopeBuilder::new(EnvelopeId::from_hash([7; 32]), &b"payload"[..])
            .type_name("post")
            .relate("author", EnvelopeId::from_hash([1; 32]))
            .field("title", "hello")
            .field("rank", 4i64)
            .previous(EnvelopeId::from_hash([2; 32]))
            .created_at(Timestamp::from_millis(1_700_000_000_000))
            .build()
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn reads_every_section() {
        let bytes = sample();
        let view = EnvelopeView::parse(&bytes).unwrap();
        assert_eq!(view.type_descriptor(), EnvelopeId::from_hash([7; 32]));
        assert_eq!(view.type_name(), Some("post"));
        assert_eq!(view.previous(), Some(EnvelopeId::from_hash([2; 32])));
        assert_eq!(
            view.created_at(),
            Some(Timestamp::from_millis(1_700_000_000_000))
        );
        assert_eq!(view.payload(), b"payload");
        assert_eq!(view.field("TITLE").map(ValueRef::to_value), Some(IndexValue::from("hello")));
        assert_eq!(view.relation("author").map(|r| r.len()), Some(1));
        assert!(view.relation("editor").is_none());
        assert!(view.verify().is_ok());
    }

    #[test]
    fn flipped_payload_bit_fails_verification() {
        let mut bytes = sample();
        let last_payload_byte = bytes.len() - EnvelopeId::LEN - 1;
        bytes[last_payload_byte] ^= 0x01;
        let view = EnvelopeView::parse(&bytes).unwrap();
        assert!(matches!(view.verify(), Err(EnvelopeError::HashMismatch { .. })));
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let bytes = sample();
        for cut in [0, 10, HEADER_LEN, bytes.len() - 1] {
            assert!(EnvelopeView::parse(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = sample();
        bytes[0] = b'X';
        assert!(matches!(
            EnvelopeView::parse(&bytes),
            Err(EnvelopeError::Malformed { offset: 0, .. })
        ));
    }

    #[test]
    fn section_table_must_be_contiguous() {
        let mut bytes = sample();
        // Grow the type name section by one byte without moving the others.
        let len_at = 8 + 32 + 4;
        let len = u32::from_be_bytes(bytes[len_at..len_at + 4].try_into().unwrap());
        bytes[len_at..len_at + 4].copy_from_slice(&(len + 1).to_be_bytes());
        assert!(EnvelopeView::parse(&bytes).is_err());
    }
}
