//! Weight patches and the math that merges them.
//!
//! - `Patch` / `PatchSet`: ordered per-weight deltas with device affinity
//! - `WeightCombiner`: merges a patch list into a dense base weight
//! - `StochasticRounder`: rounds merged weights back to their storage dtype
//! - `load_deltas`: reads patches from a safetensors delta file

mod combine;
mod loader;
mod rounding;

pub use combine::{DeltaCombiner, WeightCombiner};
pub use loader::load_deltas;
pub use rounding::{SeededRounder, StochasticRounder};

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::utils::DeviceTransfer;

/// Payload of a patch
#[derive(Debug, Clone)]
pub enum Delta {
    /// Added to the base weight
    Diff(Tensor),
    /// Low-rank update `up @ down`, scaled by `alpha / rank` when alpha is set
    LowRank {
        up: Tensor,
        down: Tensor,
        alpha: Option<f64>,
    },
    /// Replaces the base weight
    Set(Tensor),
}

impl Delta {
    fn map_tensors(
        &self,
        mut f: impl FnMut(&Tensor) -> crate::Result<Tensor>,
    ) -> crate::Result<Delta> {
        Ok(match self {
            Delta::Diff(t) => Delta::Diff(f(t)?),
            Delta::LowRank { up, down, alpha } => Delta::LowRank {
                up: f(up)?,
                down: f(down)?,
                alpha: *alpha,
            },
            Delta::Set(t) => Delta::Set(f(t)?),
        })
    }

    fn device(&self) -> &Device {
        match self {
            Delta::Diff(t) | Delta::Set(t) => t.device(),
            Delta::LowRank { up, .. } => up.device(),
        }
    }
}

/// One incremental modification of a weight
#[derive(Debug, Clone)]
pub struct Patch {
    /// Tensor identifier the patch targets
    key: String,
    /// What to merge
    delta: Delta,
    /// Multiplier applied to the delta
    strength: f64,
}

impl Patch {
    pub fn new(key: impl Into<String>, delta: Delta) -> Self {
        Self {
            key: key.into(),
            delta,
            strength: 1.0,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn delta(&self) -> &Delta {
        &self.delta
    }

    pub fn strength(&self) -> f64 {
        self.strength
    }

    /// Device the payload currently lives on
    pub fn device(&self) -> &Device {
        self.delta.device()
    }

    /// Copy of this patch with its payload on `device`
    pub fn to_device(&self, transfer: &dyn DeviceTransfer, device: &Device) -> crate::Result<Patch> {
        if self.device().same_device(device) {
            return Ok(self.clone());
        }
        let delta = self
            .delta
            .map_tensors(|t| transfer.to_device(&self.key, t, device))?;
        Ok(Self {
            key: self.key.clone(),
            delta,
            strength: self.strength,
        })
    }
}

/// Patches keyed by tensor identifier.
///
/// Patches for one identifier keep their insertion order; they are applied in
/// that order and never deduplicated.
#[derive(Debug, Clone, Default)]
pub struct PatchSet {
    patches: BTreeMap<String, Vec<Patch>>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a patch after any existing ones for the same weight
    pub fn add(&mut self, patch: Patch) {
        self.patches
            .entry(patch.key().to_string())
            .or_default()
            .push(patch);
    }

    /// Patches for a weight, in application order
    pub fn get(&self, key: &str) -> &[Patch] {
        self.patches.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.patches.contains_key(key)
    }

    /// Patched weight identifiers in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.patches.keys().cloned().collect()
    }

    /// Remove and return the patches for one weight
    pub fn clear(&mut self, key: &str) -> Vec<Patch> {
        self.patches.remove(key).unwrap_or_default()
    }

    pub fn clear_all(&mut self) {
        self.patches.clear();
    }

    /// Number of patched weights
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Number of patches across all weights
    pub fn total_patches(&self) -> usize {
        self.patches.values().map(Vec::len).sum()
    }
}
