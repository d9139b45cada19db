//! Content-addressed envelope storage for Cask.
//!
//! The store maps identities to stored envelope bytes (canonical bytes
//! followed by the identity). It never interprets payloads and never
//! overwrites: inserting an envelope that is already present is a no-op, and
//! the only deletion path is compaction.
//!
//! # Storage Backends
//!
//! All backends implement the [`EnvelopeStore`] trait:
//!
//! - [`InMemoryEnvelopeStore`] -- `HashMap`-based store for tests and embedding
//! - [`FileEnvelopeStore`] -- append-only, CRC-framed log on disk
//!
//! # Design Rules
//!
//! 1. Insert is an atomic insert-if-absent keyed by identity.
//! 2. Verify, then write, then publish: an identity is readable only after its
//!    bytes are fully written.
//! 3. Bytes that fail identity verification on read are quarantined, never
//!    served and never silently dropped.
//! 4. All I/O errors are propagated.

pub mod config;
pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use config::{StoreBackend, StoreConfig, SyncMode};
pub use error::{StoreError, StoreResult};
pub use file::{FileEnvelopeStore, FileOptions, LOG_FILE};
pub use memory::InMemoryEnvelopeStore;
pub use traits::{EnvelopeStore, Insertion};
