//! Identity engine for Cask.
//!
//! An envelope's identity is the domain-separated BLAKE3 hash of its
//! canonical bytes. Hashing is a pure function with no side effects; the
//! identity field itself is never part of the hashed input.
//!
//! Collisions are treated as a latent risk of the hash function and are not
//! handled specially.
//!
//! Hashing wraps the `blake3` crate; there is no custom cryptography.

pub mod hasher;

pub use hasher::ContentHasher;
