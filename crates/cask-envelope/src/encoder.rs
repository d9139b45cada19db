//! Canonical encoder: structural description in, deterministic bytes out.
//!
//! Relations are merged by name and sorted, targets are sorted and
//! deduplicated, and field names are normalized and sorted, so the output
//! depends only on the content and never on the order the caller declared it.

use bytes::Bytes;
use cask_crypto::ContentHasher;
use cask_types::{EnvelopeId, IndexValue, Timestamp};

use crate::config::EncoderConfig;
use crate::error::{EnvelopeError, EnvelopeResult};
use crate::layout::{self, HEADER_LEN, LAYOUT_VERSION, MAGIC, MAX_NAME_LEN, SECTION_COUNT};
use crate::schema::tombstone_schema_id;
use crate::{fields, relation};

/// Structural description of an envelope before canonicalization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvelopeDraft {
    pub type_descriptor: EnvelopeId,
    pub type_name: Option<String>,
    /// Declared relations; repeated names are merged.
    pub relationships: Vec<(String, Vec<EnvelopeId>)>,
    pub index_fields: Vec<(String, IndexValue)>,
    pub previous: Option<EnvelopeId>,
    pub created_at: Option<Timestamp>,
    pub payload: Bytes,
}

/// Produces canonical bytes from an [`EnvelopeDraft`].
#[derive(Clone, Debug, Default)]
pub struct CanonicalEncoder {
    config: EncoderConfig,
}

impl CanonicalEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode `draft` into canonical bytes (identity not included).
    pub fn encode(&self, draft: &EnvelopeDraft) -> EnvelopeResult<Vec<u8>> {
        if draft.payload.len() > self.config.max_payload_len {
            return Err(EnvelopeError::PayloadTooLarge {
                size: draft.payload.len(),
                max: self.config.max_payload_len,
            });
        }

        let type_name = draft.type_name.as_deref().filter(|n| !n.is_empty());
        if let Some(name) = type_name {
            if name.len() > MAX_NAME_LEN {
                return Err(EnvelopeError::InvalidName {
                    name: name.to_string(),
                    reason: format!("type name longer than {MAX_NAME_LEN} bytes"),
                });
            }
        }

        if draft.type_descriptor == tombstone_schema_id() && draft.previous.is_none() {
            return Err(EnvelopeError::TombstoneWithoutTarget);
        }

        let relations = relation::canonicalize(&draft.relationships)?;
        let mut relations_section = Vec::new();
        relation::encode_section(&relations, &mut relations_section)?;

        let index_fields = fields::canonicalize(&draft.index_fields)?;
        let mut fields_section = Vec::new();
        fields::encode_section(&index_fields, &mut fields_section)?;

        let previous = draft.previous.map(<[u8; 32]>::from);
        let created_at = draft.created_at.map(|ts| ts.as_millis().to_be_bytes());

        let sections: [&[u8]; SECTION_COUNT] = [
            type_name.map(str::as_bytes).unwrap_or_default(),
            &relations_section,
            &fields_section,
            previous.as_ref().map(|p| &p[..]).unwrap_or_default(),
            created_at.as_ref().map(|c| &c[..]).unwrap_or_default(),
            &draft.payload,
        ];

        let total = HEADER_LEN + sections.iter().map(|s| s.len()).sum::<usize>();
        layout::to_u32(total)?;

        let mut out = Vec::with_capacity(total + EnvelopeId::LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&LAYOUT_VERSION.to_be_bytes());
        out.extend_from_slice(&(SECTION_COUNT as u16).to_be_bytes());
        out.extend_from_slice(draft.type_descriptor.as_bytes());

        let mut offset = HEADER_LEN;
        for section in &sections {
            out.extend_from_slice(&layout::to_u32(offset)?.to_be_bytes());
            out.extend_from_slice(&layout::to_u32(section.len())?.to_be_bytes());
            offset += section.len();
        }
        for section in &sections {
            out.extend_from_slice(section);
        }
        debug_assert_eq!(out.len(), total);
        Ok(out)
    }
}

/// Identity of canonical bytes.
pub fn identity_of(canonical: &[u8]) -> EnvelopeId {
    ContentHasher::ENVELOPE.hash(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> EnvelopeDraft {
        EnvelopeDraft {
            type_descriptor: EnvelopeId::from_hash([7; 32]),
            payload: Bytes::from_static(b"body"),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_envelope_layout() {
        let bytes = CanonicalEncoder::default().encode(&draft()).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        // Empty relations and fields sections each hold a zero count.
        assert_eq!(bytes.len(), HEADER_LEN + 4 + 4 + 4);
        assert!(bytes.ends_with(b"body"));
    }

    #[test]
    fn payload_limit() {
        let encoder = CanonicalEncoder::new(EncoderConfig { max_payload_len: 3 });
        let err = encoder.encode(&draft()).unwrap_err();
        assert!(matches!(err, EnvelopeError::PayloadTooLarge { size: 4, max: 3 }));
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let a = EnvelopeId::from_hash([1; 32]);
        let b = EnvelopeId::from_hash([2; 32]);

        let mut first = draft();
        first.relationships = vec![
            ("tag".into(), vec![b, a]),
            ("author".into(), vec![a]),
        ];
        first.index_fields = vec![("title".into(), "x".into()), ("rank".into(), 3i64.into())];

        let mut second = draft();
        second.relationships = vec![
            ("author".into(), vec![a, a]),
            ("tag".into(), vec![a]),
            ("tag".into(), vec![b]),
        ];
        second.index_fields = vec![("Rank".into(), 3i64.into()), ("title".into(), "x".into())];

        let encoder = CanonicalEncoder::default();
        assert_eq!(encoder.encode(&first).unwrap(), encoder.encode(&second).unwrap());
    }

    #[test]
    fn empty_type_name_is_absent() {
        let encoder = CanonicalEncoder::default();
        let mut named = draft();
        named.type_name = Some(String::new());
        assert_eq!(encoder.encode(&named).unwrap(), encoder.encode(&draft()).unwrap());
    }

    #[test]
    fn tombstone_requires_previous() {
        let mut tomb = draft();
        tomb.type_descriptor = tombstone_schema_id();
        assert!(matches!(
            CanonicalEncoder::default().encode(&tomb),
            Err(EnvelopeError::TombstoneWithoutTarget)
        ));
    }

    #[test]
    fn identity_covers_every_field() {
        let encoder = CanonicalEncoder::default();
        let base = identity_of(&encoder.encode(&draft()).unwrap());

        let mut with_previous = draft();
        with_previous.previous = Some(EnvelopeId::from_hash([9; 32]));
        let mut with_time = draft();
        with_time.created_at = Some(Timestamp::from_millis(1));
        let mut with_name = draft();
        with_name.type_name = Some("post".into());

        for changed in [with_previous, with_time, with_name] {
            assert_ne!(identity_of(&encoder.encode(&changed).unwrap()), base);
        }
    }
}
