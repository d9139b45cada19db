//! Index fields: typed key/value pairs carried in canonical bytes.
//!
//! Names are normalized (trimmed, ASCII-lowercased) before encoding so that
//! `"Tag"` and `"tag "` address the same field. Values use fixed-width
//! big-endian bodies for numbers and timestamps.

use std::collections::BTreeMap;
use std::fmt;

use cask_types::{EnvelopeId, IndexValue, Timestamp, ValueKind};

use crate::error::{EnvelopeError, EnvelopeResult};
use crate::layout::{self, EntryTable, Reader};

/// Normalize a field name the way the encoder and every index lookup do.
pub fn normalize_field_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// A field value borrowed from canonical bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ValueRef<'a> {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(&'a str),
    Timestamp(Timestamp),
    Ref(EnvelopeId),
    Array(ArrayRef<'a>),
}

impl<'a> ValueRef<'a> {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Bool(_) => ValueKind::Bool,
            Self::Str(_) => ValueKind::String,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Ref(_) => ValueKind::Ref,
            Self::Array(_) => ValueKind::Array,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<ArrayRef<'a>> {
        match self {
            Self::Array(items) => Some(*items),
            _ => None,
        }
    }

    /// Copy into an owned [`IndexValue`].
    pub fn to_value(self) -> IndexValue {
        match self {
            Self::Int(v) => IndexValue::Int(v),
            Self::Float(v) => IndexValue::Float(v),
            Self::Bool(v) => IndexValue::Bool(v),
            Self::Str(s) => IndexValue::String(s.to_string()),
            Self::Timestamp(ts) => IndexValue::Timestamp(ts),
            Self::Ref(id) => IndexValue::Ref(id),
            Self::Array(items) => IndexValue::Array(items.iter().map(ValueRef::to_value).collect()),
        }
    }
}

/// An array value borrowed from canonical bytes. Elements are scalars.
#[derive(Clone, Copy)]
pub struct ArrayRef<'a> {
    len: usize,
    body: &'a [u8],
    base: usize,
}

impl<'a> ArrayRef<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            reader: Reader::new(self.body, self.base),
            remaining: self.len,
        }
    }
}

impl PartialEq for ArrayRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.body == other.body
    }
}

impl fmt::Debug for ArrayRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for ArrayRef<'a> {
    type Item = ValueRef<'a>;
    type IntoIter = ArrayIter<'a>;

    fn into_iter(self) -> ArrayIter<'a> {
        self.iter()
    }
}

pub struct ArrayIter<'a> {
    reader: Reader<'a>,
    remaining: usize,
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = ValueRef<'a>;

    fn next(&mut self) -> Option<ValueRef<'a>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        read_value(&mut self.reader, true).ok()
    }
}

/// A named field borrowed from canonical bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldRef<'a> {
    pub name: &'a str,
    pub value: ValueRef<'a>,
}

/// Iterator over fields in name order.
#[derive(Clone)]
pub struct Fields<'a> {
    table: EntryTable<'a>,
    next: usize,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(table: EntryTable<'a>) -> Self {
        Self { table, next: 0 }
    }

    pub(crate) fn find(table: EntryTable<'a>, name: &str) -> Option<ValueRef<'a>> {
        let (_, mut reader) = table.find(&normalize_field_name(name))?;
        read_value(&mut reader, false).ok()
    }
}

impl<'a> Iterator for Fields<'a> {
    type Item = FieldRef<'a>;

    fn next(&mut self) -> Option<FieldRef<'a>> {
        let mut reader = self.table.entry(self.next)?;
        self.next += 1;
        let name = reader.name().ok()?;
        let value = read_value(&mut reader, false).ok()?;
        Some(FieldRef { name, value })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.table.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

/// Read one tagged value, rejecting every non-canonical encoding.
fn read_value<'a>(r: &mut Reader<'a>, nested: bool) -> EnvelopeResult<ValueRef<'a>> {
    let at = r.offset();
    let tag = r.u8()?;
    let kind = ValueKind::from_tag(tag)
        .map_err(|_| EnvelopeError::malformed(at, format!("unknown value tag {tag:#04x}")))?;
    let value = match kind {
        ValueKind::Int => ValueRef::Int(i64::from_be_bytes(r.bytes8()?)),
        ValueKind::Timestamp => {
            ValueRef::Timestamp(Timestamp::from_millis(i64::from_be_bytes(r.bytes8()?)))
        }
        ValueKind::Float => {
            let v = f64::from_bits(u64::from_be_bytes(r.bytes8()?));
            if v.is_nan() {
                return Err(EnvelopeError::malformed(at, "NaN float value"));
            }
            if v == 0.0 && v.is_sign_negative() {
                return Err(EnvelopeError::malformed(at, "negative zero float value"));
            }
            ValueRef::Float(v)
        }
        ValueKind::Bool => match r.u8()? {
            0 => ValueRef::Bool(false),
            1 => ValueRef::Bool(true),
            other => {
                return Err(EnvelopeError::malformed(
                    at,
                    format!("bool byte {other:#04x}"),
                ))
            }
        },
        ValueKind::String => {
            let len = r.u32()? as usize;
            ValueRef::Str(r.str(len)?)
        }
        ValueKind::Ref => ValueRef::Ref(r.id()?),
        ValueKind::Array => {
            if nested {
                return Err(EnvelopeError::malformed(at, "nested array"));
            }
            let len = r.u32()? as usize;
            let start = r.position();
            let base = r.offset();
            for _ in 0..len {
                read_value(r, true)?;
            }
            ValueRef::Array(ArrayRef {
                len,
                body: r.since(start),
                base,
            })
        }
    };
    Ok(value)
}

/// Validate the fields section: names normalized and strictly ascending,
/// every value canonically encoded.
pub(crate) fn validate_section(section: &[u8], base: usize) -> EnvelopeResult<usize> {
    let mut previous_name: Option<&str> = None;
    layout::validate_entries(section, base, |r, _| {
        let at = r.offset();
        let name = r.name()?;
        if normalize_field_name(name) != name {
            return Err(EnvelopeError::malformed(
                at,
                format!("field name {name:?} is not normalized"),
            ));
        }
        if previous_name.is_some_and(|prev| prev >= name) {
            return Err(EnvelopeError::malformed(
                at,
                format!("field {name:?} is out of order"),
            ));
        }
        previous_name = Some(name);
        read_value(r, false).map(|_| ())
    })
}

/// Normalize declared fields into canonical order.
pub(crate) fn canonicalize(
    declared: &[(String, IndexValue)],
) -> EnvelopeResult<BTreeMap<String, &IndexValue>> {
    let mut originals: BTreeMap<String, &str> = BTreeMap::new();
    let mut out = BTreeMap::new();
    for (name, value) in declared {
        let normalized = normalize_field_name(name);
        if normalized.is_empty() {
            return Err(EnvelopeError::InvalidName {
                name: name.clone(),
                reason: "field name is empty after normalization".into(),
            });
        }
        if normalized.len() > layout::MAX_NAME_LEN {
            return Err(EnvelopeError::InvalidName {
                name: name.clone(),
                reason: format!("longer than {} bytes", layout::MAX_NAME_LEN),
            });
        }
        if let Some(first) = originals.get(&normalized) {
            return Err(EnvelopeError::FieldCollision {
                normalized,
                first: (*first).to_string(),
                second: name.clone(),
            });
        }
        originals.insert(normalized.clone(), name);
        out.insert(normalized, value);
    }
    Ok(out)
}

pub(crate) fn encode_section(
    fields: &BTreeMap<String, &IndexValue>,
    out: &mut Vec<u8>,
) -> EnvelopeResult<()> {
    let mut entries = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        let mut entry = Vec::with_capacity(1 + name.len() + 9);
        layout::put_name(&mut entry, name);
        encode_value(name, value, &mut entry, false)?;
        entries.push(entry);
    }
    layout::write_entries(out, &entries)
}

fn encode_value(
    field: &str,
    value: &IndexValue,
    out: &mut Vec<u8>,
    nested: bool,
) -> EnvelopeResult<()> {
    out.push(value.kind().tag());
    match value {
        IndexValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
        IndexValue::Timestamp(ts) => out.extend_from_slice(&ts.as_millis().to_be_bytes()),
        IndexValue::Float(v) => {
            if v.is_nan() {
                return Err(EnvelopeError::InvalidValue {
                    field: field.to_string(),
                    reason: "NaN has no canonical encoding".into(),
                });
            }
            let v = if *v == 0.0 { 0.0f64 } else { *v };
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        IndexValue::Bool(v) => out.push(u8::from(*v)),
        IndexValue::String(s) => {
            out.extend_from_slice(&layout::to_u32(s.len())?.to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        IndexValue::Ref(id) => out.extend_from_slice(id.as_bytes()),
        IndexValue::Array(items) => {
            if nested {
                return Err(EnvelopeError::InvalidValue {
                    field: field.to_string(),
                    reason: "arrays may only contain scalar values".into(),
                });
            }
            out.extend_from_slice(&layout::to_u32(items.len())?.to_be_bytes());
            for item in items {
                encode_value(field, item, out, true)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(declared: &[(String, IndexValue)]) -> (Vec<u8>, usize) {
        let fields = canonicalize(declared).unwrap();
        let mut out = Vec::new();
        encode_section(&fields, &mut out).unwrap();
        let count = validate_section(&out, 0).unwrap();
        (out, count)
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_field_name("  Title "), "title");
        assert_eq!(normalize_field_name("PublishedAt"), "publishedat");
    }

    #[test]
    fn collision_after_normalization() {
        let err = canonicalize(&[
            ("Tag".to_string(), IndexValue::Int(1)),
            ("tag ".to_string(), IndexValue::Int(2)),
        ])
        .unwrap_err();
        match err {
            EnvelopeError::FieldCollision {
                normalized,
                first,
                second,
            } => {
                assert_eq!(normalized, "tag");
                assert_eq!(first, "Tag");
                assert_eq!(second, "tag ");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn blank_name_is_rejected() {
        assert!(matches!(
            canonicalize(&[("   ".to_string(), IndexValue::Bool(true))]),
            Err(EnvelopeError::InvalidName { .. })
        ));
    }

    #[test]
    fn values_read_back() {
        let id = EnvelopeId::from_hash([4; 32]);
        let declared = vec![
            ("count".to_string(), IndexValue::Int(-12)),
            ("score".to_string(), IndexValue::Float(0.25)),
            ("draft".to_string(), IndexValue::Bool(false)),
            ("title".to_string(), IndexValue::from("hello")),
            ("at".to_string(), IndexValue::Timestamp(Timestamp::from_millis(99))),
            ("owner".to_string(), IndexValue::Ref(id)),
            ("tags".to_string(), IndexValue::from(vec!["rust", "db"])),
        ];
        let (bytes, count) = section(&declared);
        assert_eq!(count, declared.len());

        let table = EntryTable::new(&bytes, 0, count);
        for (name, value) in &declared {
            let found = Fields::find(table, name).unwrap();
            assert_eq!(&found.to_value(), value, "field {name}");
        }
        let names: Vec<_> = Fields::new(table).map(|f| f.name).collect();
        assert_eq!(names, ["at", "count", "draft", "owner", "score", "tags", "title"]);
    }

    #[test]
    fn lookup_normalizes_query() {
        let (bytes, count) = section(&[("Title".to_string(), IndexValue::from("x"))]);
        let table = EntryTable::new(&bytes, 0, count);
        assert_eq!(Fields::find(table, " TITLE").and_then(|v| v.as_str()), Some("x"));
    }

    #[test]
    fn array_iterates_elements() {
        let (bytes, count) = section(&[("tags".to_string(), IndexValue::from(vec!["a", "b", "c"]))]);
        let table = EntryTable::new(&bytes, 0, count);
        let tags = Fields::find(table, "tags").unwrap().as_array().unwrap();
        assert_eq!(tags.len(), 3);
        let items: Vec<_> = tags.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(items, ["a", "b", "c"]);
    }

    #[test]
    fn negative_zero_is_normalized() {
        let (a, _) = section(&[("x".to_string(), IndexValue::Float(-0.0))]);
        let (b, _) = section(&[("x".to_string(), IndexValue::Float(0.0))]);
        assert_eq!(a, b);
    }

    #[test]
    fn nan_and_nested_arrays_are_rejected() {
        let binding = [("x".to_string(), IndexValue::Float(f64::NAN))];
        let fields = canonicalize(&binding).unwrap();
        assert!(matches!(
            encode_section(&fields, &mut Vec::new()),
            Err(EnvelopeError::InvalidValue { .. })
        ));

        let nested = IndexValue::Array(vec![IndexValue::Array(vec![])]);
        let binding = [("x".to_string(), nested)];
        let fields = canonicalize(&binding).unwrap();
        assert!(matches!(
            encode_section(&fields, &mut Vec::new()),
            Err(EnvelopeError::InvalidValue { .. })
        ));
    }

    #[test]
    fn non_canonical_bool_fails_validation() {
        let (mut bytes, _) = section(&[("flag".to_string(), IndexValue::Bool(true))]);
        let last = bytes.len() - 1;
        bytes[last] = 2;
        assert!(validate_section(&bytes, 0).is_err());
    }
}
