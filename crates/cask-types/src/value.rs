//! Typed index values and their order-preserving keys.
//!
//! Index fields are opaque typed key/value pairs to the core: field names and
//! types are conventionally defined by a schema envelope but never enforced.
//! This module only fixes the value model and how scalar values map onto
//! byte keys whose lexicographic order matches the natural order of the value.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::EnvelopeId;
use crate::temporal::Timestamp;

/// Kind tag of an [`IndexValue`].
///
/// The discriminants are part of the canonical envelope layout and of every
/// [`ValueKey`]; existing values must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    Int = 0x01,
    Float = 0x02,
    Bool = 0x03,
    String = 0x04,
    Timestamp = 0x05,
    Ref = 0x06,
    Array = 0x07,
}

impl ValueKind {
    /// The on-wire tag byte.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Parse a tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, TypeError> {
        match tag {
            0x01 => Ok(Self::Int),
            0x02 => Ok(Self::Float),
            0x03 => Ok(Self::Bool),
            0x04 => Ok(Self::String),
            0x05 => Ok(Self::Timestamp),
            0x06 => Ok(Self::Ref),
            0x07 => Ok(Self::Array),
            other => Err(TypeError::UnknownValueTag(other)),
        }
    }

    /// Whether values of this kind live in the range index.
    pub const fn is_rangeable(self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Timestamp)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Timestamp => "timestamp",
            Self::Ref => "ref",
            Self::Array => "array",
        };
        f.write_str(name)
    }
}

/// A typed value attached to an envelope under a field name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum IndexValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Timestamp(Timestamp),
    /// Reference to another envelope by identity.
    Ref(EnvelopeId),
    /// Array of scalar values (tag lists and the like).
    Array(Vec<IndexValue>),
}

impl IndexValue {
    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Bool(_) => ValueKind::Bool,
            Self::String(_) => ValueKind::String,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Ref(_) => ValueKind::Ref,
            Self::Array(_) => ValueKind::Array,
        }
    }

    /// Returns `true` for every kind except [`IndexValue::Array`].
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::Array(_))
    }

    /// The elements of an array value.
    pub fn as_array(&self) -> Option<&[IndexValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Order-preserving key for a scalar value. Arrays have no key.
    pub fn key(&self) -> Option<ValueKey> {
        let mut buf = Vec::with_capacity(9);
        buf.push(self.kind().tag());
        match self {
            Self::Int(v) => buf.extend_from_slice(&sortable_i64(*v)),
            Self::Timestamp(ts) => buf.extend_from_slice(&sortable_i64(ts.as_millis())),
            Self::Float(v) => buf.extend_from_slice(&sortable_f64(*v)),
            Self::Bool(v) => buf.push(u8::from(*v)),
            Self::String(s) => buf.extend_from_slice(s.as_bytes()),
            Self::Ref(id) => buf.extend_from_slice(id.as_bytes()),
            Self::Array(_) => return None,
        }
        Some(ValueKey(buf))
    }
}

/// Flip the sign bit so two's-complement order becomes unsigned byte order.
fn sortable_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1 << 63)).to_be_bytes()
}

/// IEEE-754 total order as unsigned bytes; `-0.0` collapses onto `0.0`.
fn sortable_f64(v: f64) -> [u8; 8] {
    let v = if v == 0.0 { 0.0 } else { v };
    let bits = v.to_bits();
    let bits = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    bits.to_be_bytes()
}

fn unsortable_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

fn unsortable_f64(bytes: [u8; 8]) -> f64 {
    let bits = u64::from_be_bytes(bytes);
    let bits = if bits & (1 << 63) != 0 {
        bits & !(1 << 63)
    } else {
        !bits
    };
    f64::from_bits(bits)
}

/// Byte key of a scalar [`IndexValue`]: kind tag followed by an encoding
/// whose lexicographic order matches the value order within that kind.
///
/// Keys of different kinds never interleave, so a range scan bounded by two
/// integers only ever visits integers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueKey(Vec<u8>);

impl ValueKey {
    /// Smallest possible key of `kind`; sorts before every value of that kind.
    pub fn kind_start(kind: ValueKind) -> Self {
        Self(vec![kind.tag()])
    }

    /// Smallest key of the next kind; sorts after every value of `kind`.
    pub fn kind_end(kind: ValueKind) -> Self {
        Self(vec![kind.tag() + 1])
    }

    /// The kind this key was derived from.
    pub fn kind(&self) -> Option<ValueKind> {
        self.0.first().and_then(|t| ValueKind::from_tag(*t).ok())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Recover the scalar value this key was built from.
    pub fn to_value(&self) -> Option<IndexValue> {
        let (tag, body) = self.0.split_first()?;
        let fixed = |body: &[u8]| -> Option<[u8; 8]> { body.try_into().ok() };
        match ValueKind::from_tag(*tag).ok()? {
            ValueKind::Int => Some(IndexValue::Int(unsortable_i64(fixed(body)?))),
            ValueKind::Timestamp => Some(IndexValue::Timestamp(Timestamp::from_millis(
                unsortable_i64(fixed(body)?),
            ))),
            ValueKind::Float => Some(IndexValue::Float(unsortable_f64(fixed(body)?))),
            ValueKind::Bool => match body {
                [0] => Some(IndexValue::Bool(false)),
                [1] => Some(IndexValue::Bool(true)),
                _ => None,
            },
            ValueKind::String => String::from_utf8(body.to_vec()).ok().map(IndexValue::String),
            ValueKind::Ref => EnvelopeId::from_slice(body).ok().map(IndexValue::Ref),
            ValueKind::Array => None,
        }
    }
}

impl fmt::Debug for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_value() {
            Some(value) => write!(f, "ValueKey({value:?})"),
            None => write!(f, "ValueKey({})", hex::encode(&self.0)),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for IndexValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Timestamp> for IndexValue {
    fn from(v: Timestamp) -> Self {
        Self::Timestamp(v)
    }
}

impl From<EnvelopeId> for IndexValue {
    fn from(v: EnvelopeId) -> Self {
        Self::Ref(v)
    }
}

impl<T: Into<IndexValue>> From<Vec<T>> for IndexValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn kind_tags_are_stable() {
        for kind in [
            ValueKind::Int,
            ValueKind::Float,
            ValueKind::Bool,
            ValueKind::String,
            ValueKind::Timestamp,
            ValueKind::Ref,
            ValueKind::Array,
        ] {
            assert_eq!(ValueKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert_eq!(
            ValueKind::from_tag(0x42),
            Err(TypeError::UnknownValueTag(0x42))
        );
    }

    #[test]
    fn arrays_have_no_key() {
        let tags: IndexValue = vec!["x", "y"].into();
        assert!(tags.key().is_none());
        assert!(!tags.is_scalar());
        assert_eq!(tags.as_array().map(<[IndexValue]>::len), Some(2));
    }

    #[test]
    fn negative_zero_collapses() {
        let a = IndexValue::Float(0.0).key().unwrap();
        let b = IndexValue::Float(-0.0).key().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn kinds_do_not_interleave() {
        let int_max = IndexValue::Int(i64::MAX).key().unwrap();
        let float_min = IndexValue::Float(f64::NEG_INFINITY).key().unwrap();
        assert!(int_max < float_min);
        assert_eq!(int_max.kind(), Some(ValueKind::Int));
    }

    #[test]
    fn kind_bounds_enclose_all_values() {
        let start = ValueKey::kind_start(ValueKind::Int);
        let end = ValueKey::kind_end(ValueKind::Int);
        for v in [i64::MIN, -1, 0, i64::MAX] {
            let key = IndexValue::Int(v).key().unwrap();
            assert!(start < key && key < end);
        }
        assert!(IndexValue::Float(f64::NEG_INFINITY).key().unwrap() > end);
    }

    #[test]
    fn key_recovers_value() {
        let id = EnvelopeId::from_hash([9; 32]);
        for value in [
            IndexValue::Int(-7),
            IndexValue::Float(2.5),
            IndexValue::Bool(true),
            IndexValue::String("rust".into()),
            IndexValue::Timestamp(Timestamp::from_millis(1_708_523_400)),
            IndexValue::Ref(id),
        ] {
            assert_eq!(value.key().unwrap().to_value(), Some(value));
        }
    }

    #[test]
    fn debug_shows_value() {
        let key = IndexValue::Int(5).key().unwrap();
        assert_eq!(format!("{key:?}"), "ValueKey(Int(5))");
    }

    proptest! {
        #[test]
        fn int_keys_preserve_order(a in any::<i64>(), b in any::<i64>()) {
            let ka = IndexValue::Int(a).key().unwrap();
            let kb = IndexValue::Int(b).key().unwrap();
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn float_keys_preserve_order(
            a in proptest::num::f64::NORMAL | proptest::num::f64::ZERO | proptest::num::f64::INFINITE,
            b in proptest::num::f64::NORMAL | proptest::num::f64::ZERO | proptest::num::f64::INFINITE,
        ) {
            let ka = IndexValue::Float(a).key().unwrap();
            let kb = IndexValue::Float(b).key().unwrap();
            prop_assert_eq!(a.partial_cmp(&b).unwrap(), ka.cmp(&kb));
        }

        #[test]
        fn string_keys_preserve_order(a in ".*", b in ".*") {
            let ka = IndexValue::String(a.clone()).key().unwrap();
            let kb = IndexValue::String(b.clone()).key().unwrap();
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ka.cmp(&kb));
        }
    }
}
