//! Reserved schema identities.
//!
//! A schema is an ordinary envelope whose payload is a type definition. Two
//! identities are built in: the null id names the root meta-schema (the type
//! of every schema), and the tombstone schema types logical deletions.

use std::sync::OnceLock;

use bytes::Bytes;
use cask_crypto::ContentHasher;
use cask_types::EnvelopeId;

use crate::envelope::EnvelopeBuilder;

/// Type descriptor of schema envelopes. Resolution of a type chain stops here.
pub const META_SCHEMA: EnvelopeId = EnvelopeId::null();

/// Type descriptor of tombstone envelopes.
///
/// Hashed in the reserved domain so no stored envelope can collide with it.
pub fn tombstone_schema_id() -> EnvelopeId {
    static ID: OnceLock<EnvelopeId> = OnceLock::new();
    *ID.get_or_init(|| ContentHasher::RESERVED.hash(b"schema:tombstone"))
}

/// Whether `id` is a built-in schema that never needs resolving.
pub fn is_reserved(id: &EnvelopeId) -> bool {
    *id == META_SCHEMA || *id == tombstone_schema_id()
}

/// Start building a schema envelope carrying `definition` as its payload.
pub fn schema_envelope(name: &str, definition: impl Into<Bytes>) -> EnvelopeBuilder {
    EnvelopeBuilder::new(META_SCHEMA, definition).type_name(name)
}
