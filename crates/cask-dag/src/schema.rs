//! Type descriptor resolution.
//!
//! A type descriptor names a schema envelope, whose own type descriptor names
//! another schema, and so on up to a built-in schema. Resolution is bounded:
//! a chain longer than `max_depth`, or one through a schema that is not
//! stored, is rejected rather than retried.

use cask_envelope::is_reserved;
use cask_store::EnvelopeStore;
use cask_types::EnvelopeId;
use serde::{Deserialize, Serialize};

use crate::error::{DagError, DagResult};

/// Default bound on type chain length.
pub const DEFAULT_MAX_SCHEMA_DEPTH: usize = 16;

/// The schemas typing an envelope, nearest first, ending at a built-in
/// schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChain {
    pub schemas: Vec<EnvelopeId>,
}

impl TypeChain {
    /// The schema the envelope is directly typed by.
    pub fn immediate(&self) -> Option<EnvelopeId> {
        self.schemas.first().copied()
    }

    /// The built-in schema the chain ends at.
    pub fn terminal(&self) -> Option<EnvelopeId> {
        self.schemas.last().copied()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Resolve the type chain of the stored envelope `id`.
///
/// At most `max_depth` stored schemas are followed before a built-in one must
/// be reached.
pub fn resolve_type_chain(
    store: &dyn EnvelopeStore,
    id: &EnvelopeId,
    max_depth: usize,
) -> DagResult<TypeChain> {
    let envelope = store.read(id)?.ok_or(DagError::NotFound(*id))?;
    let mut schemas = Vec::new();
    let mut current = envelope.type_descriptor();
    loop {
        schemas.push(current);
        if is_reserved(&current) {
            return Ok(TypeChain { schemas });
        }
        if schemas.len() > max_depth {
            return Err(DagError::SchemaTooDeep {
                id: *id,
                max_depth,
            });
        }
        let schema = store
            .read(&current)?
            .ok_or(DagError::UnresolvedSchema {
                id: *id,
                schema: current,
            })?;
        current = schema.type_descriptor();
    }
}
