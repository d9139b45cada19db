//! High-level SDK for Cask.
//!
//! [`Cask`] ties the content-addressed store, the derived indexes, and the
//! lineage table into one ingestion pipeline and query surface. This is the
//! main entry point for applications embedding Cask.

pub mod cask;
pub mod config;
pub mod error;
pub mod receipt;

pub use cask::Cask;
pub use config::{CaskConfig, LINEAGE_FILE};
pub use error::{ErrorKind, SdkError, SdkResult};
pub use receipt::{CompactionReport, PutReceipt};

// Re-export key types
pub use cask_dag::{Reachability, TypeChain};
pub use cask_envelope::{
    schema_envelope, tombstone_schema_id, EncoderConfig, Envelope, EnvelopeBuilder, Relationship,
    ValueRef, META_SCHEMA,
};
pub use cask_index::{ConsistencyReport, Referrer, RepairReport};
pub use cask_refs::{Advance, Lineage};
pub use cask_store::{StoreBackend, StoreConfig, SyncMode};
pub use cask_types::{EnvelopeId, IndexValue, Timestamp};
