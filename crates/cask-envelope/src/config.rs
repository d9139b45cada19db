use serde::{Deserialize, Serialize};

/// Configuration for the canonical encoder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Maximum payload size in bytes (default: 64 MiB).
    pub max_payload_len: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            max_payload_len: 64 * 1024 * 1024, // 64 MiB
        }
    }
}
