use std::path::{Path, PathBuf};

use cask_dag::DEFAULT_MAX_SCHEMA_DEPTH;
use cask_envelope::EncoderConfig;
use cask_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// File name of the lineage snapshot inside a data directory. Its journal
/// sits beside it as `lineages.journal`.
pub const LINEAGE_FILE: &str = "lineages.json";

/// Top-level configuration of a [`Cask`](crate::Cask).
///
/// Every key is optional in TOML; missing keys take their defaults.
///
/// ```toml
/// max_schema_depth = 8
/// lineage_path = "/var/lib/cask/lineages.json"
///
/// [encoder]
/// max_payload_len = 1048576
///
/// [store]
/// sync_mode = "every_write"
/// backend = { file = { path = "/var/lib/cask" } }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaskConfig {
    pub encoder: EncoderConfig,
    pub store: StoreConfig,
    /// Where the lineage table is persisted. In memory when unset, and
    /// rebuilt from the store on open.
    pub lineage_path: Option<PathBuf>,
    /// Bound on type chain resolution.
    pub max_schema_depth: usize,
}

impl Default for CaskConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            store: StoreConfig::default(),
            lineage_path: None,
            max_schema_depth: DEFAULT_MAX_SCHEMA_DEPTH,
        }
    }
}

impl CaskConfig {
    /// Everything persisted under `dir`: the envelope log and the lineage
    /// snapshot.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            store: StoreConfig::file(dir),
            lineage_path: Some(dir.join(LINEAGE_FILE)),
            ..Self::default()
        }
    }

    pub fn from_toml_str(contents: &str) -> SdkResult<Self> {
        toml::from_str(contents).map_err(|e| SdkError::Config(e.to_string()))
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_store::{StoreBackend, SyncMode};

    #[test]
    fn default_config() {
        let config = CaskConfig::default();
        assert_eq!(config.max_schema_depth, 16);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.lineage_path.is_none());
        assert_eq!(config.encoder, EncoderConfig::default());
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(CaskConfig::from_toml_str("").unwrap(), CaskConfig::default());
    }

    #[test]
    fn full_toml() {
        let config = CaskConfig::from_toml_str(
            r#"
            max_schema_depth = 8
            lineage_path = "/data/lineages.json"

            [encoder]
            max_payload_len = 1024

            [store]
            sync_mode = "every_write"
            verify_on_read = false
            backend = { file = { path = "/data" } }
            "#,
        )
        .unwrap();
        assert_eq!(config.max_schema_depth, 8);
        assert_eq!(config.encoder.max_payload_len, 1024);
        assert_eq!(config.store.sync_mode, SyncMode::EveryWrite);
        assert!(!config.store.verify_on_read);
        assert_eq!(
            config.store.backend,
            StoreBackend::File {
                path: PathBuf::from("/data")
            }
        );
        assert_eq!(config.lineage_path, Some(PathBuf::from("/data/lineages.json")));
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(
            CaskConfig::from_toml_str("max_schema_depth = \"deep\""),
            Err(SdkError::Config(_))
        ));
    }

    #[test]
    fn load_missing_file_gives_default() {
        let config = CaskConfig::load("/nonexistent/path/cask.toml").unwrap();
        assert_eq!(config, CaskConfig::default());
    }

    #[test]
    fn in_dir_persists_everything() {
        let config = CaskConfig::in_dir("/srv/cask");
        assert_eq!(config.lineage_path, Some(PathBuf::from("/srv/cask/lineages.json")));
        assert!(matches!(config.store.backend, StoreBackend::File { .. }));
    }
}
