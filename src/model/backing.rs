//! Per-weight storage state and the one-time mmap release.
//!
//! Every weight starts out `MappedReadOnly`, aliasing the checkpoint's file
//! mapping. It becomes `Materialized` once a dense value has been written for
//! it or its payload has been copied into owned memory, and never goes back.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{Device, DeviceLocation};

use super::store::{Weight, WeightStore, WriteMode};
use super::DeviceRoles;
use crate::checkpoint::Checkpoint;
use crate::quantization::QuantizedBlock;
use crate::utils::DeviceTransfer;

/// Where a weight's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageState {
    /// Aliases the read-only file mapping
    #[default]
    MappedReadOnly,
    /// Owned, mutable memory
    Materialized,
}

/// Pre-patch value of a weight, restored on revert
#[derive(Debug, Clone)]
pub struct Backup {
    pub value: Weight,
    /// Restore by overwriting the parameter instead of rebinding it
    pub in_place: bool,
}

impl Backup {
    /// Snapshot `current` onto the offload device.
    ///
    /// An in-place snapshot is always a fresh copy, since the parameter it
    /// was taken from will be overwritten.
    pub fn capture(
        key: &str,
        current: &Weight,
        in_place: bool,
        transfer: &dyn DeviceTransfer,
        offload: &Device,
    ) -> crate::Result<Self> {
        let value = match current {
            Weight::Dense(tensor) => {
                let moved = transfer.to_device(key, tensor, offload)?;
                if in_place {
                    Weight::Dense(moved.copy()?)
                } else {
                    Weight::Dense(moved)
                }
            }
            Weight::Quantized(q) => Weight::Quantized(q.clone().with_device(offload.clone())),
        };
        Ok(Self { value, in_place })
    }

    pub fn write_mode(&self) -> WriteMode {
        if self.in_place {
            WriteMode::InPlace
        } else {
            WriteMode::Bind
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackingRecord {
    pub name: String,
    pub state: StorageState,
    pub backup: Option<Backup>,
}

impl BackingRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StorageState::MappedReadOnly,
            backup: None,
        }
    }
}

/// Result of one release pass
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// Records moved to `Materialized` by this pass
    pub released: usize,
    /// Weights left mapped, with the reason
    pub failures: Vec<(String, crate::QuantPatchError)>,
}

/// Devices the release pass works between.
///
/// Residency is compared by location tag, the same tag
/// `WeightStore::device_tag` reports.
#[derive(Debug, Clone)]
pub struct ReleaseScope {
    /// Device every copy is staged through
    via: Device,
    load: DeviceLocation,
    offload: DeviceLocation,
}

impl ReleaseScope {
    pub fn new(roles: &DeviceRoles) -> Self {
        Self::tagged(roles.load.clone(), roles.load.location(), roles.offload.location())
    }

    /// Stage copies through `via` and compare store tags against `load` and
    /// `offload`, for hosts whose tags do not come from candle devices
    pub fn tagged(via: Device, load: DeviceLocation, offload: DeviceLocation) -> Self {
        Self { via, load, offload }
    }

    /// With one device for both roles no weight ever leaves the offload device
    pub fn is_active(&self) -> bool {
        self.load != self.offload
    }

    /// Whether a weight tagged `tag` is actively used
    pub fn in_use(&self, tag: DeviceLocation) -> bool {
        tag != self.offload
    }
}

/// Backing records of one handle
#[derive(Debug, Clone, Default)]
pub struct BackingStoreLifecycle {
    records: BTreeMap<String, BackingRecord>,
    mmap_released: bool,
}

impl BackingStoreLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a weight; weights never accessed are still mapped
    pub fn state(&self, key: &str) -> StorageState {
        self.records
            .get(key)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn record(&self, key: &str) -> Option<&BackingRecord> {
        self.records.get(key)
    }

    pub fn records(&self) -> impl Iterator<Item = &BackingRecord> {
        self.records.values()
    }

    pub fn backup(&self, key: &str) -> Option<&Backup> {
        self.records.get(key).and_then(|r| r.backup.as_ref())
    }

    pub fn has_backup(&self, key: &str) -> bool {
        self.backup(key).is_some()
    }

    /// Keys holding a backup, in sorted order
    pub fn backup_keys(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.backup.is_some())
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn is_released(&self) -> bool {
        self.mmap_released
    }

    pub(crate) fn set_backup(&mut self, key: &str, backup: Backup) {
        self.entry(key).backup = Some(backup);
    }

    pub(crate) fn clear_backup(&mut self, key: &str) -> Option<Backup> {
        self.records.get_mut(key).and_then(|r| r.backup.take())
    }

    pub(crate) fn mark_materialized(&mut self, key: &str) {
        self.entry(key).state = StorageState::Materialized;
    }

    /// A cloned handle is a new instance and gets its own release pass
    pub(crate) fn reset_release(&mut self) {
        self.mmap_released = false;
    }

    fn entry(&mut self, key: &str) -> &mut BackingRecord {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| BackingRecord::new(key))
    }

    /// Copy the weights in use that still alias the file mapping into owned
    /// memory.
    ///
    /// Only `MappedReadOnly` weights whose store tag is off the offload device
    /// are copied, and nothing is when load and offload are one device. Runs
    /// once per handle; later calls report nothing released. A weight that
    /// fails to copy stays `MappedReadOnly` and the pass moves on.
    pub fn release_mapped_regions<S: WeightStore + ?Sized>(
        &mut self,
        store: &mut S,
        checkpoint: &Checkpoint,
        transfer: &dyn DeviceTransfer,
        scope: &ReleaseScope,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        if self.mmap_released {
            return report;
        }
        self.mmap_released = true;

        if !scope.is_active() {
            tracing::debug!("Load and offload device match, keeping mmap");
            return report;
        }

        let blocks: Vec<Arc<QuantizedBlock>> = checkpoint
            .blocks()
            .into_iter()
            .filter(|b| self.state(b.name()) == StorageState::MappedReadOnly)
            .filter(|b| store.device_tag(b.name()).is_some_and(|tag| scope.in_use(tag)))
            .collect();
        if blocks.is_empty() {
            return report;
        }
        tracing::info!("Attempting to release mmap ({})", blocks.len());

        for block in blocks {
            let name = block.name().to_string();
            match self.detach(store, checkpoint, transfer, &scope.via, &block) {
                Ok(()) => {
                    self.mark_materialized(&name);
                    report.released += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to release mmap for {}: {}", name, e);
                    report.failures.push((name, e));
                }
            }
        }

        tracing::info!(
            "Released {} weights, {} still mapped",
            report.released,
            checkpoint.mapped_blocks()
        );
        report
    }

    /// Swap every alias of a mapped block this handle can see for one owned copy
    fn detach<S: WeightStore + ?Sized>(
        &mut self,
        store: &mut S,
        checkpoint: &Checkpoint,
        transfer: &dyn DeviceTransfer,
        via: &Device,
        block: &Arc<QuantizedBlock>,
    ) -> crate::Result<()> {
        let name = block.name();
        let owned = if block.is_mapped() {
            let copy = transfer.detach_block(block, via)?;
            checkpoint.replace_detached(name, Arc::new(copy))?
        } else {
            block.clone()
        };

        if let Some(Weight::Quantized(q)) = store.weight(name) {
            if q.block().is_mapped() {
                let swapped = q.with_block(owned.clone());
                store.set_weight(name, Weight::Quantized(swapped), WriteMode::Bind)?;
            }
        }

        if let Some(backup) = self.records.get_mut(name).and_then(|r| r.backup.as_mut()) {
            if let Weight::Quantized(q) = &backup.value {
                if q.block().is_mapped() {
                    backup.value = Weight::Quantized(q.clone().with_block(owned));
                }
            }
        }
        Ok(())
    }
}
