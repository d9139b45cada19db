//! # cask-envelope
//!
//! The envelope format: canonical encoding, identity, zero-copy access, and
//! the forward relationship model.
//!
//! An envelope wraps an opaque payload with a type descriptor (the identity
//! of a schema envelope), named relations to other envelopes, typed index
//! fields, and an optional `previous` link forming a version chain. Its
//! identity is the hash of its canonical bytes, so identical content always
//! collapses to the same id.

pub mod config;
pub mod encoder;
pub mod envelope;
pub mod error;
pub mod fields;
pub mod layout;
pub mod relation;
pub mod schema;
pub mod view;

pub use config::EncoderConfig;
pub use encoder::{identity_of, CanonicalEncoder, EnvelopeDraft};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use error::{EnvelopeError, EnvelopeResult};
pub use fields::{normalize_field_name, ArrayRef, FieldRef, Fields, ValueRef};
pub use relation::{RelationRef, Relations, Relationship, Targets};
pub use schema::{is_reserved, schema_envelope, tombstone_schema_id, META_SCHEMA};
pub use view::EnvelopeView;
