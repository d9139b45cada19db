//! Derived query indexes for Cask.
//!
//! Indexes accelerate queries over stored envelopes without ever being the
//! source of truth: each one is a pure function of the envelopes in the store
//! and can be rebuilt from a full scan.
//!
//! # Key Types
//!
//! - [`EnvelopeIndex`] -- exact, range, inverted, reverse-reference, type, and successor indexes
//! - [`IndexEntries`] -- the entries one envelope contributes, extracted without locking
//! - [`Referrer`] -- a `(source, relation)` pair from the reverse-reference index
//! - [`ConsistencyReport`] / [`RepairReport`] -- divergence between index and store

pub mod entry;
pub mod error;
pub mod index;

pub use entry::{IndexEntries, Referrer};
pub use error::{IndexError, IndexResult};
pub use index::{ConsistencyReport, EnvelopeIndex, IndexSnapshot, RepairReport};
