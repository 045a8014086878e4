//! Patched model handles and the weight lifecycle behind them.
//!
//! - `WeightStore`: what the host model exposes (read, write, enumerate)
//! - `WeightMaterializer`: one weight access, from checkpoint block to stored value
//! - `BackingStoreLifecycle`: per-weight storage state and the mmap release pass
//! - `PatchedModelHandle`: patch set + records over a shared checkpoint

mod backing;
mod handle;
mod materializer;
mod store;

pub use backing::{
    BackingRecord, BackingStoreLifecycle, Backup, ReleaseReport, ReleaseScope, StorageState,
};
pub use handle::{PassReport, PatchedModelHandle, RevertReport};
pub use materializer::WeightMaterializer;
pub use store::{
    dense_value, DeferredPatches, ParameterStore, QuantizedWeight, Weight, WeightStore, WriteMode,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::Device;

use crate::patch::{DeltaCombiner, SeededRounder, StochasticRounder, WeightCombiner};
use crate::quantization::KernelRegistry;
use crate::utils::{CandleTransfer, DeviceTransfer};

/// Collaborators shared by a handle and all of its clones
#[derive(Clone)]
pub struct PatchContext {
    pub kernels: Arc<KernelRegistry>,
    pub combiner: Arc<dyn WeightCombiner>,
    pub rounder: Arc<dyn StochasticRounder>,
    pub transfer: Arc<dyn DeviceTransfer>,
}

impl PatchContext {
    /// Default collaborators, rounding with `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            kernels: Arc::new(KernelRegistry::default()),
            combiner: Arc::new(DeltaCombiner),
            rounder: Arc::new(SeededRounder::new(seed)),
            transfer: Arc::new(CandleTransfer),
        }
    }

    pub fn with_kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = Arc::new(kernels);
        self
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn WeightCombiner>) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn with_rounder(mut self, rounder: Arc<dyn StochasticRounder>) -> Self {
        self.rounder = rounder;
        self
    }

    pub fn with_transfer(mut self, transfer: Arc<dyn DeviceTransfer>) -> Self {
        self.transfer = transfer;
        self
    }
}

impl Default for PatchContext {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl std::fmt::Debug for PatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchContext")
            .field("kernels", &self.kernels)
            .finish_non_exhaustive()
    }
}

/// Devices a handle moves weights between
#[derive(Debug, Clone)]
pub struct DeviceRoles {
    /// Where weights are computed on
    pub load: Device,
    /// Where backups and parked weights live
    pub offload: Device,
}

impl DeviceRoles {
    pub fn new(load: Device, offload: Device) -> Self {
        Self { load, offload }
    }

    /// Load and offload both on the host
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, Device::Cpu)
    }

    /// Device deferred patches are parked on
    pub fn patch_device(&self, patch_on_device: bool) -> &Device {
        if patch_on_device {
            &self.load
        } else {
            &self.offload
        }
    }
}

/// Target device per weight for a full load
#[derive(Debug, Clone)]
pub struct DevicePlan {
    default: Device,
    overrides: BTreeMap<String, Device>,
}

impl DevicePlan {
    /// Every weight on `device`
    pub fn all_on(device: Device) -> Self {
        Self {
            default: device,
            overrides: BTreeMap::new(),
        }
    }

    /// Place one weight elsewhere
    pub fn with_device(mut self, key: impl Into<String>, device: Device) -> Self {
        self.overrides.insert(key.into(), device);
        self
    }

    pub fn device_for(&self, key: &str) -> &Device {
        self.overrides.get(key).unwrap_or(&self.default)
    }
}
