//! Canonical byte layout of an envelope.
//!
//! Stored envelopes are the canonical bytes followed by the 32-byte identity.
//! The canonical bytes are what gets hashed:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "CASK"
//! 4       2     layout version (u16 BE)
//! 6       2     section count (u16 BE, always 6)
//! 8       32    type descriptor
//! 40      48    section table: 6 x (offset u32 BE, length u32 BE)
//! 88      ...   sections, contiguous and in table order:
//!               type name | relations | fields | previous | created_at | payload
//! end     32    identity (stored bytes only, never hashed)
//! ```
//!
//! Relations and fields sections start with an entry count and a table of
//! entry offsets so a reader can binary-search a name without scanning:
//!
//! ```text
//! [count u32] [count x entry offset u32, relative to section start] [entries]
//! relation entry: [name len u8] [name] [target count u32] [targets, 32 bytes each]
//! field entry:    [name len u8] [name] [value tag u8] [value body]
//! ```
//!
//! All integers are big-endian; numbers and timestamps are fixed width.

use std::ops::Range;

use cask_types::EnvelopeId;

use crate::error::{EnvelopeError, EnvelopeResult};

/// Magic bytes at the start of every envelope.
pub const MAGIC: &[u8; 4] = b"CASK";
/// Current layout version.
pub const LAYOUT_VERSION: u16 = 1;
/// Number of entries in the section table.
pub const SECTION_COUNT: usize = 6;
/// Size of the fixed header including the section table.
pub const HEADER_LEN: usize = 4 + 2 + 2 + EnvelopeId::LEN + SECTION_COUNT * 8;
/// Longest relation, field, or type name in bytes.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

pub(crate) const TYPE_DESCRIPTOR_RANGE: Range<usize> = 8..8 + EnvelopeId::LEN;
const TABLE_START: usize = 8 + EnvelopeId::LEN;

/// The variable-length sections of the canonical layout, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    TypeName = 0,
    Relations = 1,
    Fields = 2,
    Previous = 3,
    CreatedAt = 4,
    Payload = 5,
}

impl Section {
    pub const ALL: [Section; SECTION_COUNT] = [
        Section::TypeName,
        Section::Relations,
        Section::Fields,
        Section::Previous,
        Section::CreatedAt,
        Section::Payload,
    ];
}

/// Absolute position of one section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Validated section positions of one envelope.
///
/// A `Layout` can only be obtained by validating bytes, so every accessor
/// built on top of it reads within bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    pub(crate) spans: [Span; SECTION_COUNT],
    pub(crate) canonical_len: usize,
    pub(crate) relation_count: usize,
    pub(crate) field_count: usize,
}

impl Layout {
    /// Position of a section.
    pub fn span(&self, section: Section) -> Span {
        self.spans[section as usize]
    }

    /// Length of the canonical (hashed) prefix.
    pub fn canonical_len(&self) -> usize {
        self.canonical_len
    }

    /// Read the header and section table of stored bytes.
    ///
    /// Only the framing is checked here; section contents are validated by
    /// [`crate::view::EnvelopeView::parse`].
    pub(crate) fn read_frame(stored: &[u8]) -> EnvelopeResult<Self> {
        if stored.len() < HEADER_LEN + EnvelopeId::LEN {
            return Err(EnvelopeError::malformed(
                0,
                format!("envelope of {} bytes is shorter than the header", stored.len()),
            ));
        }
        let canonical_len = stored.len() - EnvelopeId::LEN;
        let mut r = Reader::new(&stored[..canonical_len], 0);

        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(EnvelopeError::malformed(0, "bad magic"));
        }
        let version = r.u16()?;
        if version != LAYOUT_VERSION {
            return Err(EnvelopeError::malformed(
                4,
                format!("unsupported layout version {version}"),
            ));
        }
        let count = r.u16()? as usize;
        if count != SECTION_COUNT {
            return Err(EnvelopeError::malformed(
                6,
                format!("expected {SECTION_COUNT} sections, found {count}"),
            ));
        }
        r.take(EnvelopeId::LEN)?;

        let mut spans = [Span::default(); SECTION_COUNT];
        let mut expected_offset = HEADER_LEN;
        for span in spans.iter_mut() {
            let at = r.offset();
            let offset = r.u32()? as usize;
            let len = r.u32()? as usize;
            if offset != expected_offset {
                return Err(EnvelopeError::malformed(
                    at,
                    format!("section starts at {offset}, expected {expected_offset}"),
                ));
            }
            expected_offset = offset
                .checked_add(len)
                .filter(|end| *end <= canonical_len)
                .ok_or_else(|| EnvelopeError::malformed(at, "section extends past the envelope"))?;
            *span = Span { offset, len };
        }
        if expected_offset != canonical_len {
            return Err(EnvelopeError::malformed(
                expected_offset,
                "trailing bytes after the payload section",
            ));
        }

        Ok(Self {
            spans,
            canonical_len,
            relation_count: 0,
            field_count: 0,
        })
    }
}

/// Bounds-checked big-endian reader over a byte slice.
///
/// `base` is the absolute offset of `buf` inside the envelope so that error
/// messages point at the real byte position.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, pos: 0, base }
    }

    /// Absolute offset of the next byte.
    pub(crate) fn offset(&self) -> usize {
        self.base + self.pos
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Bytes consumed since relative position `start`.
    pub(crate) fn since(&self, start: usize) -> &'a [u8] {
        self.buf.get(start..self.pos).unwrap_or(&[])
    }

    pub(crate) fn take(&mut self, n: usize) -> EnvelopeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                EnvelopeError::malformed(
                    self.offset(),
                    format!("need {n} bytes, {} left", self.buf.len() - self.pos),
                )
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn fixed<const N: usize>(&mut self) -> EnvelopeResult<[u8; N]> {
        let at = self.offset();
        self.take(N)?
            .try_into()
            .map_err(|_| EnvelopeError::malformed(at, "short read"))
    }

    pub(crate) fn u8(&mut self) -> EnvelopeResult<u8> {
        Ok(self.fixed::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> EnvelopeResult<u16> {
        Ok(u16::from_be_bytes(self.fixed()?))
    }

    pub(crate) fn u32(&mut self) -> EnvelopeResult<u32> {
        Ok(u32::from_be_bytes(self.fixed()?))
    }

    pub(crate) fn bytes8(&mut self) -> EnvelopeResult<[u8; 8]> {
        self.fixed()
    }

    pub(crate) fn id(&mut self) -> EnvelopeResult<EnvelopeId> {
        Ok(EnvelopeId::from_hash(self.fixed()?))
    }

    pub(crate) fn str(&mut self, len: usize) -> EnvelopeResult<&'a str> {
        let at = self.offset();
        let raw = self.take(len)?;
        std::str::from_utf8(raw).map_err(|e| EnvelopeError::malformed(at, e.to_string()))
    }

    /// A `u8`-length-prefixed, non-empty UTF-8 name.
    pub(crate) fn name(&mut self) -> EnvelopeResult<&'a str> {
        let at = self.offset();
        let len = self.u8()? as usize;
        if len == 0 {
            return Err(EnvelopeError::malformed(at, "empty name"));
        }
        self.str(len)
    }
}

/// Offset table at the front of the relations and fields sections.
#[derive(Clone, Copy)]
pub(crate) struct EntryTable<'a> {
    section: &'a [u8],
    base: usize,
    count: usize,
}

impl<'a> EntryTable<'a> {
    /// Table over a section whose framing has already been validated.
    pub(crate) fn new(section: &'a [u8], base: usize, count: usize) -> Self {
        Self {
            section,
            base,
            count,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Reader positioned at the start of entry `index`.
    pub(crate) fn entry(&self, index: usize) -> Option<Reader<'a>> {
        if index >= self.count {
            return None;
        }
        let slot = 4 + index * 4;
        let raw: [u8; 4] = self.section.get(slot..slot + 4)?.try_into().ok()?;
        let start = u32::from_be_bytes(raw) as usize;
        let body = self.section.get(start..)?;
        Some(Reader::new(body, self.base + start))
    }

    /// Binary search entries by their leading name. The returned reader is
    /// positioned just after the name.
    pub(crate) fn find(&self, name: &str) -> Option<(&'a str, Reader<'a>)> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mut reader = self.entry(mid)?;
            let probe = reader.name().ok()?;
            match probe.cmp(name) {
                std::cmp::Ordering::Equal => return Some((probe, reader)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }
}

/// Read the entry count and offset table of a section, checking that every
/// entry starts exactly where the previous one ended. Returns the count and a
/// reader positioned at the first entry; `on_entry` parses one entry.
pub(crate) fn validate_entries<'a>(
    section: &'a [u8],
    base: usize,
    mut on_entry: impl FnMut(&mut Reader<'a>, usize) -> EnvelopeResult<()>,
) -> EnvelopeResult<usize> {
    if section.is_empty() {
        return Err(EnvelopeError::malformed(base, "missing entry count"));
    }
    let mut r = Reader::new(section, base);
    let count = r.u32()? as usize;
    let table_len = count
        .checked_mul(4)
        .ok_or_else(|| EnvelopeError::malformed(base, "entry count overflows"))?;
    let table = r.take(table_len)?;
    for (index, slot) in table.chunks_exact(4).enumerate() {
        let at = r.offset();
        let expected = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
        if expected != r.position() {
            return Err(EnvelopeError::malformed(
                at,
                format!("entry {index} starts at {}, table says {expected}", r.position()),
            ));
        }
        on_entry(&mut r, index)?;
    }
    if !r.is_empty() {
        return Err(EnvelopeError::malformed(r.offset(), "trailing bytes after last entry"));
    }
    Ok(count)
}

/// Write an entry section: count, offset table, then the entries.
pub(crate) fn write_entries(out: &mut Vec<u8>, entries: &[Vec<u8>]) -> EnvelopeResult<()> {
    let count = u32::try_from(entries.len()).map_err(|_| EnvelopeError::TooLarge {
        size: entries.len(),
    })?;
    out.extend_from_slice(&count.to_be_bytes());
    let mut offset = 4 + entries.len() * 4;
    for entry in entries {
        out.extend_from_slice(&to_u32(offset)?.to_be_bytes());
        offset += entry.len();
    }
    for entry in entries {
        out.extend_from_slice(entry);
    }
    Ok(())
}

/// Append a `u8`-length-prefixed name.
pub(crate) fn put_name(out: &mut Vec<u8>, name: &str) {
    // Callers validate `name.len() <= MAX_NAME_LEN` beforehand.
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

pub(crate) fn to_u32(value: usize) -> EnvelopeResult<u32> {
    u32::try_from(value).map_err(|_| EnvelopeError::TooLarge { size: value })
}
