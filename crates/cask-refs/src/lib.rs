//! Lineage tracking for Cask version chains.
//!
//! Envelopes link backwards through `previous`; this crate keeps the forward
//! view: for every lineage, its members, the members nobody supersedes yet
//! (the heads), and which members are tombstones. It is the one piece of
//! mutable shared state in Cask, so every update goes through a per-lineage
//! compare-and-swap.
//!
//! # Key Types
//!
//! - [`Lineage`] -- members, heads, and tombstones of one version chain
//! - [`LineageStore`] -- trait for table backends (CAS updates)
//! - [`InMemoryLineageStore`] -- in-memory backend
//! - [`FileLineageStore`] -- backend persisted as a JSON snapshot plus an
//!   append-only journal
//! - [`LineageTracker`] -- records envelopes and rebuilds the table from a store

pub mod error;
pub mod file;
pub mod memory;
pub mod tracker;
pub mod traits;
pub mod types;

pub use error::{LineageError, LineageResult};
pub use file::{journal_path_for, FileLineageStore};
pub use memory::InMemoryLineageStore;
pub use tracker::{LineageTracker, MAX_CAS_ATTEMPTS};
pub use traits::LineageStore;
pub use types::{Advance, Lineage};
