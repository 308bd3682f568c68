//! Codec limits and tuning

use serde::{Deserialize, Serialize};

/// Knobs for [`crate::Database::open_with`] and [`crate::Database::save_with`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Largest decompressed body (and attachment) accepted, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Payload size of each authenticated block written on save
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Decode freshly encoded bytes before handing them out
    #[serde(default = "default_true")]
    pub verify_after_save: bool,
}

fn default_max_body_size() -> usize {
    256 * 1024 * 1024
}

fn default_block_size() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            block_size: default_block_size(),
            verify_after_save: true,
        }
    }
}
