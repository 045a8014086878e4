//! Single-weight access: checkpoint block in, stored weight out.

use candle_core::{DType, Device};

use super::backing::{Backup, BackingStoreLifecycle};
use super::store::{QuantizedWeight, Weight, WeightStore, WriteMode};
use super::{DeviceRoles, PatchContext};
use crate::checkpoint::Checkpoint;
use crate::config::PatcherConfig;
use crate::patch::{Patch, PatchSet};
use crate::quantization::{DequantizationGate, GateRequest, Resolved};

/// Borrowed view of a handle's state for materializing weights.
///
/// The base for every access is the checkpoint block, never the store's
/// current value, so patches never compound across accesses or clones.
pub struct WeightMaterializer<'a> {
    checkpoint: &'a Checkpoint,
    patches: &'a PatchSet,
    context: &'a PatchContext,
    config: &'a PatcherConfig,
    devices: &'a DeviceRoles,
}

impl<'a> WeightMaterializer<'a> {
    pub fn new(
        checkpoint: &'a Checkpoint,
        patches: &'a PatchSet,
        context: &'a PatchContext,
        config: &'a PatcherConfig,
        devices: &'a DeviceRoles,
    ) -> Self {
        Self {
            checkpoint,
            patches,
            context,
            config,
            devices,
        }
    }

    /// Produce the value of `key` for the host and write it into `store`.
    ///
    /// Unpatched weights with a direct-compute kernel stay quantized. Anything
    /// else is expanded to `dtype` on `target`, patched, rounded back to its
    /// storage dtype and written with `WriteMode::InPlace` when `in_place` (or
    /// the config) asks for it. Backup and record changes land only after the
    /// write succeeds.
    pub fn materialize<S: WeightStore + ?Sized>(
        &self,
        store: &mut S,
        backing: &mut BackingStoreLifecycle,
        key: &str,
        target: Option<&Device>,
        dtype: DType,
        in_place: bool,
    ) -> crate::Result<Weight> {
        let block = self
            .checkpoint
            .block(key)
            .ok_or_else(|| crate::QuantPatchError::MissingWeight(key.to_string()))?;
        let patches = self.patches.get(key);

        let request = GateRequest::new(dtype)
            .with_patches(!patches.is_empty())
            .deferring(self.config.defer_quantized_patches);
        let resolved = DequantizationGate::new(&self.context.kernels).resolve(&block, request)?;

        let target = target
            .cloned()
            .or_else(|| store.device_of(key))
            .unwrap_or_else(|| self.devices.load.clone());

        match resolved {
            Resolved::StillQuantized(block) => {
                let mut weight = QuantizedWeight::new(block, target);
                if !patches.is_empty() {
                    let parked = self.devices.patch_device(self.config.patch_on_device);
                    weight = weight.with_deferred(self.move_patches(patches, parked)?);
                }

                store.set_weight(key, Weight::Quantized(weight.clone()), WriteMode::Bind)?;
                tracing::debug!(
                    "{} kept quantized ({:?}, {} deferred patches)",
                    key,
                    weight.block().kind(),
                    patches.len()
                );
                Ok(Weight::Quantized(weight))
            }
            Resolved::Dense(base, _) => {
                let in_place = in_place || self.config.weight_inplace_update;
                let transfer = self.context.transfer.as_ref();

                let backup = match (backing.has_backup(key), store.weight(key)) {
                    (false, Some(current)) => Some(Backup::capture(
                        key,
                        &current,
                        in_place,
                        transfer,
                        &self.devices.offload,
                    )?),
                    _ => None,
                };

                let base = transfer.to_device(key, &base, &target)?;
                let patches = self.move_patches(patches, base.device())?;
                let merged = self.context.combiner.combine(key, base, &patches)?;

                let storage_dtype = block.kind().dense_dtype().unwrap_or(dtype);
                let rounded = self.context.rounder.round(&merged, storage_dtype)?;

                let mode = if in_place {
                    WriteMode::InPlace
                } else {
                    WriteMode::Bind
                };
                store.set_weight(key, Weight::Dense(rounded.clone()), mode)?;

                if let Some(backup) = backup {
                    backing.set_backup(key, backup);
                }
                backing.mark_materialized(key);
                tracing::debug!(
                    "{} materialized as {:?} with {} patches ({:?})",
                    key,
                    storage_dtype,
                    patches.len(),
                    mode
                );
                Ok(Weight::Dense(rounded))
            }
        }
    }

    fn move_patches(&self, patches: &[Patch], device: &Device) -> crate::Result<Vec<Patch>> {
        patches
            .iter()
            .map(|p| p.to_device(self.context.transfer.as_ref(), device))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParameterStore, StorageState};
    use crate::patch::{Delta, SeededRounder, StochasticRounder};
    use crate::quantization::{KernelRegistry, QuantKind, QuantizedBlock};
    use crate::utils::{CandleTransfer, DeviceTransfer};
    use candle_core::Tensor;
    use std::sync::{Arc, Mutex};

    /// Transfer that fails every copy of one weight
    struct FailOn(&'static str);

    impl DeviceTransfer for FailOn {
        fn to_device(&self, name: &str, tensor: &Tensor, device: &Device) -> crate::Result<Tensor> {
            if name == self.0 {
                return Err(crate::QuantPatchError::DeviceTransfer {
                    name: name.to_string(),
                    reason: "device lost".to_string(),
                });
            }
            CandleTransfer.to_device(name, tensor, device)
        }

        fn detach_block(&self, block: &QuantizedBlock, via: &Device) -> crate::Result<QuantizedBlock> {
            CandleTransfer.detach_block(block, via)
        }
    }

    /// Rounder that records the storage dtypes it is asked for
    #[derive(Default)]
    struct RecordingRounder {
        requested: Mutex<Vec<DType>>,
    }

    impl StochasticRounder for RecordingRounder {
        fn round(&self, tensor: &Tensor, dtype: DType) -> crate::Result<Tensor> {
            self.requested.lock().unwrap().push(dtype);
            SeededRounder::new(0).round(tensor, dtype)
        }
    }

    fn bf16_checkpoint() -> Checkpoint {
        let data = [1.0f32, 2.0]
            .iter()
            .flat_map(|v| half::bf16::from_f32(*v).to_le_bytes())
            .collect();
        let block = QuantizedBlock::owned("w", QuantKind::BF16, vec![2], data).unwrap();
        Checkpoint::from_blocks(vec![block])
    }

    fn diff_patches(value: f32) -> PatchSet {
        let mut patches = PatchSet::new();
        let diff = Tensor::new(&[value, value], &Device::Cpu).unwrap();
        patches.add(Patch::new("w", Delta::Diff(diff)));
        patches
    }

    #[test]
    fn test_dense_path_rounds_to_storage_dtype() {
        let checkpoint = bf16_checkpoint();
        let mut store = ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu);
        let mut backing = BackingStoreLifecycle::new();
        let patches = diff_patches(1.0);
        let (context, config, devices) =
            (PatchContext::default(), PatcherConfig::default(), DeviceRoles::cpu());

        let materializer =
            WeightMaterializer::new(&checkpoint, &patches, &context, &config, &devices);
        let weight = materializer
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap();

        let tensor = weight.as_dense().unwrap();
        assert_eq!(tensor.dtype(), DType::BF16);
        let values: Vec<f32> = tensor.to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(backing.state("w"), StorageState::Materialized);
        assert!(backing.has_backup("w"));
        assert!(store.get("w").unwrap().is_dense());
    }

    #[test]
    fn test_repeat_access_does_not_compound() {
        let checkpoint = bf16_checkpoint();
        let mut store = ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu);
        let mut backing = BackingStoreLifecycle::new();
        let patches = diff_patches(1.0);
        let (context, config, devices) =
            (PatchContext::default(), PatcherConfig::default(), DeviceRoles::cpu());
        let materializer =
            WeightMaterializer::new(&checkpoint, &patches, &context, &config, &devices);

        for _ in 0..3 {
            materializer
                .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
                .unwrap();
        }

        let stored = store.get("w").unwrap().as_dense().unwrap().clone();
        let values: Vec<f32> = stored.to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 3.0]);
        // Backup still holds the pre-patch quantized weight
        assert!(!backing.backup("w").unwrap().value.is_dense());
    }

    #[test]
    fn test_failed_patch_leaves_record_untouched() {
        let checkpoint = bf16_checkpoint();
        let mut store = ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu);
        let mut backing = BackingStoreLifecycle::new();
        let mut patches = PatchSet::new();
        let wrong = Tensor::new(&[1.0f32, 1.0, 1.0], &Device::Cpu).unwrap();
        patches.add(Patch::new("w", Delta::Diff(wrong)));
        let (context, config, devices) =
            (PatchContext::default(), PatcherConfig::default(), DeviceRoles::cpu());

        let materializer =
            WeightMaterializer::new(&checkpoint, &patches, &context, &config, &devices);
        let err = materializer
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap_err();

        assert!(matches!(err, crate::QuantPatchError::IncompatibleShape { .. }));
        assert!(backing.record("w").is_none());
        assert!(!store.get("w").unwrap().is_dense());
    }

    #[test]
    fn test_deferred_patches_stay_quantized() {
        let mut data = half::f16::from_f32(0.5).to_le_bytes().to_vec();
        data.extend((0..32).map(|i| i as u8));
        let block = QuantizedBlock::owned("w", QuantKind::Q8_0, vec![32], data).unwrap();
        let checkpoint = Checkpoint::from_blocks(vec![block]);
        let mut store = ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu);
        let mut backing = BackingStoreLifecycle::new();

        let mut patches = PatchSet::new();
        let diff = Tensor::ones(32, DType::F32, &Device::Cpu).unwrap();
        patches.add(Patch::new("w", Delta::Diff(diff)));
        let context = PatchContext::default();
        let config = PatcherConfig {
            defer_quantized_patches: true,
            ..PatcherConfig::default()
        };
        let devices = DeviceRoles::cpu();

        let materializer =
            WeightMaterializer::new(&checkpoint, &patches, &context, &config, &devices);
        let weight = materializer
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap();

        let quantized = weight.as_quantized().unwrap();
        assert!(quantized.has_deferred());
        assert_eq!(backing.state("w"), StorageState::MappedReadOnly);

        let expanded = quantized
            .dequantize(&KernelRegistry::default(), context.combiner.as_ref(), DType::F32)
            .unwrap();
        let values: Vec<f32> = expanded.to_vec1().unwrap();
        assert_eq!(values[0], 1.0);
        assert_eq!(values[2], 2.0);
    }

    #[test]
    fn test_missing_weight() {
        let checkpoint = bf16_checkpoint();
        let mut store = ParameterStore::new();
        let mut backing = BackingStoreLifecycle::new();
        let patches = PatchSet::new();
        let (context, config, devices) =
            (PatchContext::default(), PatcherConfig::default(), DeviceRoles::cpu());

        let materializer =
            WeightMaterializer::new(&checkpoint, &patches, &context, &config, &devices);
        let err = materializer
            .materialize(&mut store, &mut backing, "nope", None, DType::F32, false)
            .unwrap_err();
        assert!(matches!(err, crate::QuantPatchError::MissingWeight(_)));
    }

    #[test]
    fn test_failed_transfer_leaves_record_and_backup() {
        let checkpoint = bf16_checkpoint();
        let mut store = ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu);
        let mut backing = BackingStoreLifecycle::new();
        let (config, devices) = (PatcherConfig::default(), DeviceRoles::cpu());
        let failing = PatchContext::default().with_transfer(Arc::new(FailOn("w")));
        let patches = diff_patches(2.0);

        // First access fails before anything is recorded
        let err = WeightMaterializer::new(&checkpoint, &patches, &failing, &config, &devices)
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap_err();
        assert!(matches!(err, crate::QuantPatchError::DeviceTransfer { .. }));
        assert!(backing.record("w").is_none());
        assert!(!store.get("w").unwrap().is_dense());

        // A later failure keeps the committed state from the last success
        let context = PatchContext::default();
        let first = diff_patches(1.0);
        WeightMaterializer::new(&checkpoint, &first, &context, &config, &devices)
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap();

        let err = WeightMaterializer::new(&checkpoint, &patches, &failing, &config, &devices)
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap_err();
        assert!(matches!(err, crate::QuantPatchError::DeviceTransfer { .. }));
        assert_eq!(backing.state("w"), StorageState::Materialized);
        assert!(!backing.backup("w").unwrap().value.is_dense());
        let stored = store.get("w").unwrap().as_dense().unwrap().clone();
        let values: Vec<f32> = stored.to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![2.0, 3.0]);
    }

    #[test]
    fn test_rounder_gets_storage_dtype() {
        let checkpoint = bf16_checkpoint();
        let mut store = ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu);
        let mut backing = BackingStoreLifecycle::new();
        let patches = diff_patches(1.0);
        let rounder = Arc::new(RecordingRounder::default());
        let context = PatchContext::default().with_rounder(rounder.clone());
        let (config, devices) = (PatcherConfig::default(), DeviceRoles::cpu());

        WeightMaterializer::new(&checkpoint, &patches, &context, &config, &devices)
            .materialize(&mut store, &mut backing, "w", None, DType::F32, false)
            .unwrap();
        assert_eq!(*rounder.requested.lock().unwrap(), vec![DType::BF16]);
    }
}
