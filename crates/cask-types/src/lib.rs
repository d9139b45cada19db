//! Foundation types for Cask, the content-addressed envelope store.
//!
//! Every other Cask crate depends on `cask-types`.
//!
//! # Key Types
//!
//! - [`EnvelopeId`] -- 256-bit content hash identifying an envelope
//! - [`Timestamp`] -- milliseconds since the UNIX epoch, used for index values
//! - [`IndexValue`] -- typed value attached to an envelope for query acceleration
//! - [`ValueKey`] -- order-preserving byte key derived from a scalar [`IndexValue`]

pub mod error;
pub mod id;
pub mod temporal;
pub mod value;

pub use error::TypeError;
pub use id::EnvelopeId;
pub use temporal::Timestamp;
pub use value::{IndexValue, ValueKey, ValueKind};
