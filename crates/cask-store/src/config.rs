use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::file::{FileEnvelopeStore, FileOptions};
use crate::memory::InMemoryEnvelopeStore;
use crate::traits::EnvelopeStore;

/// Flush strategy for the file-backed store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every append.
    EveryWrite,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

/// Which backend holds the envelopes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// Append-only log under `path`.
    File { path: PathBuf },
}

/// Store configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sync_mode: SyncMode,
    /// Re-hash envelopes on every read and quarantine mismatches.
    pub verify_on_read: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sync_mode: SyncMode::default(),
            verify_on_read: true,
        }
    }
}

impl StoreConfig {
    /// File-backed configuration rooted at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StoreBackend::File { path: path.into() },
            ..Self::default()
        }
    }

    pub fn file_options(&self) -> FileOptions {
        FileOptions {
            sync_mode: self.sync_mode,
            verify_on_read: self.verify_on_read,
        }
    }

    /// Open the configured backend.
    pub fn open(&self) -> StoreResult<Arc<dyn EnvelopeStore>> {
        match &self.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryEnvelopeStore::new())),
            StoreBackend::File { path } => {
                Ok(Arc::new(FileEnvelopeStore::open(path, self.file_options())?))
            }
        }
    }
}
