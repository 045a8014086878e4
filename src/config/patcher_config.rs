//! Tuning knobs for a patched model handle.

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Handle configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatcherConfig {
    /// Precision weights are expanded to before patches are merged
    #[serde(default = "default_compute_dtype")]
    pub compute_dtype: String,

    /// Keep deferred patches on the load device instead of the offload device
    #[serde(default)]
    pub patch_on_device: bool,

    /// Leave patched block-quantized weights quantized and merge their
    /// patches at compute time
    #[serde(default)]
    pub defer_quantized_patches: bool,

    /// Write every materialized weight in place, regardless of the caller
    #[serde(default)]
    pub weight_inplace_update: bool,

    /// Seed for stochastic rounding
    #[serde(default)]
    pub rounding_seed: u64,
}

fn default_compute_dtype() -> String {
    "f32".to_string()
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            compute_dtype: default_compute_dtype(),
            patch_on_device: false,
            defer_quantized_patches: false,
            weight_inplace_update: false,
            rounding_seed: 0,
        }
    }
}

impl PatcherConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PatcherConfig = serde_json::from_str(&content)?;
        config.compute_dtype()?;
        Ok(config)
    }

    /// Parsed compute dtype
    pub fn compute_dtype(&self) -> crate::Result<DType> {
        crate::utils::parse_dtype(&self.compute_dtype)
    }
}
