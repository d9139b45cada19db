//! Version chains and the relationship graph for Cask.
//!
//! Resolves lineage heads and deletion state from the lineage table, walks
//! forward and reverse relationship edges, and resolves the self-hosted type
//! system one schema envelope at a time.

pub mod error;
pub mod graph;
pub mod resolver;
pub mod schema;

pub use error::{DagError, DagResult};
pub use graph::{Reachability, RelationshipGraph};
pub use resolver::VersionResolver;
pub use schema::{resolve_type_chain, TypeChain, DEFAULT_MAX_SCHEMA_DEPTH};
