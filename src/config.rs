use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Model configuration stored next to the weights as `config.json`.
///
/// All keys are optional; converted models without a configuration behave
/// as if every list were empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    /// Token ids suppressed at every step when the caller passes the `-1`
    /// sentinel in `suppress_tokens`.
    #[serde(default)]
    pub suppress_ids: Vec<u32>,
    /// Token ids suppressed at the first generated step when
    /// `suppress_blank` is set.
    #[serde(default)]
    pub suppress_ids_begin: Vec<u32>,
    /// Token ids of the language markers, used by language detection.
    #[serde(default)]
    pub lang_ids: Vec<u32>,
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
