//! End-to-end behavior of patched handles over real checkpoint files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use candle_core::quantized::{gguf_file, GgmlDType, QTensor};
use candle_core::{DType, Device, DeviceLocation, Tensor};

use rs_quantpatch::model::dense_value;
use rs_quantpatch::{
    load_deltas, CandleTransfer, Checkpoint, Delta, DeltaCombiner, DevicePlan, DeviceRoles,
    DeviceTransfer, KernelRegistry, ParameterStore, Patch, PatchContext, PatchedModelHandle,
    PatcherConfig, QuantKind, QuantPatchError, QuantizedBlock, ReleaseScope, StorageState, Weight,
    WeightStore,
};

type Handle = PatchedModelHandle<ParameterStore>;

/// Two Q8_0 tensors, `a` and `b`, each [2, 32]
fn write_gguf(dir: &Path) -> PathBuf {
    let a = Tensor::arange(0f32, 64.0, &Device::Cpu)
        .unwrap()
        .reshape((2, 32))
        .unwrap()
        .affine(0.125, -4.0)
        .unwrap();
    let b = Tensor::ones((2, 32), DType::F32, &Device::Cpu).unwrap();
    let qa = QTensor::quantize(&a, GgmlDType::Q8_0).unwrap();
    let qb = QTensor::quantize(&b, GgmlDType::Q8_0).unwrap();

    let path = dir.join("tiny-Q8_0.gguf");
    let mut file = std::fs::File::create(&path).unwrap();
    let name = gguf_file::Value::String("tiny".to_string());
    gguf_file::write(&mut file, &[("general.name", &name)], &[("a", &qa), ("b", &qb)]).unwrap();
    path
}

fn open(path: &Path) -> (Arc<Checkpoint>, Arc<RwLock<ParameterStore>>, Handle) {
    let checkpoint = Arc::new(Checkpoint::open(path).unwrap());
    let store = Arc::new(RwLock::new(ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu)));
    let handle = PatchedModelHandle::new(&store, checkpoint.clone(), DeviceRoles::cpu());
    (checkpoint, store, handle)
}

/// Host computes, offload tagged as a separate accelerator, so the release
/// pass treats host-resident weights as in use
fn open_offloaded(path: &Path) -> (Arc<Checkpoint>, Arc<RwLock<ParameterStore>>, Handle) {
    let (checkpoint, store, handle) = open(path);
    let scope =
        ReleaseScope::tagged(Device::Cpu, DeviceLocation::Cpu, DeviceLocation::Cuda { gpu_id: 0 });
    (checkpoint, store, handle.with_release_scope(scope))
}

/// Transfer that fails every copy of one weight
struct FailOn(&'static str);

impl FailOn {
    fn error(&self) -> QuantPatchError {
        QuantPatchError::DeviceTransfer {
            name: self.0.to_string(),
            reason: "out of memory".to_string(),
        }
    }
}

impl DeviceTransfer for FailOn {
    fn to_device(
        &self,
        name: &str,
        tensor: &Tensor,
        device: &Device,
    ) -> rs_quantpatch::Result<Tensor> {
        if name == self.0 {
            return Err(self.error());
        }
        CandleTransfer.to_device(name, tensor, device)
    }

    fn detach_block(
        &self,
        block: &QuantizedBlock,
        via: &Device,
    ) -> rs_quantpatch::Result<QuantizedBlock> {
        if block.name() == self.0 {
            return Err(self.error());
        }
        CandleTransfer.detach_block(block, via)
    }
}

fn diff(key: &str, value: f32) -> Patch {
    let delta = Tensor::full(value, (2, 32), &Device::Cpu).unwrap();
    Patch::new(key, Delta::Diff(delta))
}

/// Values of a weight as the host would compute with them
fn dense_values(weight: &Weight) -> Vec<f32> {
    dense_value(weight, &KernelRegistry::default(), &DeltaCombiner, DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

/// Dequantized checkpoint value of `key`, shifted by `offset`
fn shifted_base(checkpoint: &Checkpoint, key: &str, offset: f64) -> Vec<f32> {
    let base = KernelRegistry::default()
        .kernel_for(QuantKind::Q8_0)
        .unwrap()
        .dequantize(&checkpoint.block(key).unwrap(), DType::F32)
        .unwrap();
    (base + offset).unwrap().flatten_all().unwrap().to_vec1().unwrap()
}

fn stored_bytes(store: &RwLock<ParameterStore>, key: &str) -> Vec<u8> {
    let guard = store.read().unwrap();
    let weight = guard.get(key).unwrap().as_quantized().unwrap().clone();
    weight.block().bytes().to_vec()
}

#[test]
fn test_checkpoint_opens_mapped() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = Checkpoint::open(write_gguf(dir.path())).unwrap();

    assert_eq!(checkpoint.names(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(checkpoint.mapped_blocks(), 2);
    assert_eq!(checkpoint.metadata().get("general.name").map(String::as_str), Some("tiny"));

    let a = checkpoint.block("a").unwrap();
    assert_eq!(a.kind(), QuantKind::Q8_0);
    assert_eq!(a.shape(), &[2, 32]);
    // Two blocks per row of 32, 34 bytes each
    assert_eq!(a.byte_len(), 2 * 34);
}

#[test]
fn test_unpatched_weight_stays_quantized() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, _store, mut handle) = open(&write_gguf(dir.path()));

    let weight = handle.materialize("b", None, false).unwrap();
    assert!(!weight.is_dense());
    assert_eq!(handle.backing().state("b"), StorageState::MappedReadOnly);
}

#[test]
fn test_patched_weight_is_dense() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, store, mut handle) = open(&write_gguf(dir.path()));
    handle.add_patch(diff("b", 0.5));

    let weight = handle.materialize("b", None, false).unwrap();
    assert!(weight.is_dense());
    assert_eq!(dense_values(&weight), shifted_base(&checkpoint, "b", 0.5));
    assert!(store.read().unwrap().get("b").unwrap().is_dense());
}

#[test]
fn test_first_load_patches_one_of_two() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, store, mut handle) = open_offloaded(&write_gguf(dir.path()));
    let b_before = stored_bytes(&store, "b");

    assert_eq!(handle.add_patches(vec![diff("a", 1.0)]), vec!["a".to_string()]);
    let report = handle.first_load(&DevicePlan::all_on(Device::Cpu)).unwrap();

    assert!(report.is_clean());
    assert_eq!(report.dense, vec!["a".to_string()]);
    assert_eq!(report.quantized, vec!["b".to_string()]);
    // `a` was already materialized by its dense write; only `b` moves off the mapping
    assert_eq!(report.released, 1);
    assert!(checkpoint.block("a").unwrap().is_mapped());
    assert!(!checkpoint.block("b").unwrap().is_mapped());
    assert!(handle.backing().is_released());

    // Merged against the dequantized base
    let a = store.read().unwrap().weight("a").unwrap();
    assert_eq!(dense_values(&a), shifted_base(&checkpoint, "a", 1.0));

    // `b` is untouched, now owned instead of mapped
    assert_eq!(stored_bytes(&store, "b"), b_before);
    let b = store.read().unwrap().weight("b").unwrap();
    assert!(!b.as_quantized().unwrap().block().is_mapped());

    for key in ["a", "b"] {
        assert_eq!(handle.backing().state(key), StorageState::Materialized);
    }
}

#[test]
fn test_first_load_on_one_device_keeps_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, _store, mut handle) = open(&write_gguf(dir.path()));
    handle.add_patch(diff("a", 1.0));

    let report = handle.first_load(&DevicePlan::all_on(Device::Cpu)).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.released, 0);
    assert_eq!(checkpoint.mapped_blocks(), 2);
    assert_eq!(handle.backing().state("b"), StorageState::MappedReadOnly);
    assert!(handle.backing().is_released());
}

#[test]
fn test_release_failure_keeps_weight_mapped() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, _store, handle) = open_offloaded(&write_gguf(dir.path()));
    let mut handle = handle.with_context(PatchContext::default().with_transfer(Arc::new(FailOn("a"))));

    let report = handle.release_mapped_regions().unwrap();
    assert_eq!(report.released, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "a");
    assert!(matches!(report.failures[0].1, QuantPatchError::DeviceTransfer { .. }));

    assert_eq!(handle.backing().state("a"), StorageState::MappedReadOnly);
    assert_eq!(handle.backing().state("b"), StorageState::Materialized);
    assert!(checkpoint.block("a").unwrap().is_mapped());
    assert_eq!(checkpoint.mapped_blocks(), 1);
}

#[test]
fn test_release_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, _store, mut handle) = open_offloaded(&write_gguf(dir.path()));

    let first = handle.release_mapped_regions().unwrap();
    assert_eq!(first.released, 2);
    let states: Vec<StorageState> = handle.backing().records().map(|r| r.state).collect();

    let second = handle.release_mapped_regions().unwrap();
    assert_eq!(second.released, 0);
    assert!(second.failures.is_empty());
    let after: Vec<StorageState> = handle.backing().records().map(|r| r.state).collect();
    assert_eq!(states, after);
}

#[test]
fn test_clones_produce_identical_output() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, _store, mut handle) = open(&write_gguf(dir.path()));
    handle.add_patch(diff("a", 0.25));

    let mut left = handle.clone();
    let mut right = handle.clone();
    let l = left.materialize("a", None, false).unwrap();
    let r = right.materialize("a", None, false).unwrap();
    assert_eq!(dense_values(&l), dense_values(&r));
}

#[test]
fn test_clones_materialize_on_separate_threads() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, _store, handle) = open(&write_gguf(dir.path()));

    let mut left = handle.clone();
    let mut right = handle.clone();
    left.add_patch(diff("a", 1.0));
    right.add_patch(diff("a", 2.0));

    let (l, r) = std::thread::scope(|scope| {
        let l = scope.spawn(move || {
            let weight = left.materialize("a", None, false).unwrap();
            (dense_values(&weight), left.backing().state("a"))
        });
        let r = scope.spawn(move || {
            let weight = right.materialize("a", None, false).unwrap();
            (dense_values(&weight), right.backing().state("a"))
        });
        (l.join().unwrap(), r.join().unwrap())
    });

    assert_eq!(l.0, shifted_base(&checkpoint, "a", 1.0));
    assert_eq!(r.0, shifted_base(&checkpoint, "a", 2.0));
    assert_eq!(l.1, StorageState::Materialized);
    assert_eq!(r.1, StorageState::Materialized);
    assert_eq!(handle.backing().state("a"), StorageState::MappedReadOnly);
}

#[test]
fn test_clone_patches_do_not_leak() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, store, mut original) = open(&write_gguf(dir.path()));
    let a_before = stored_bytes(&store, "a");

    let mut variant = original.clone();
    variant.add_patch(diff("a", 2.0));
    variant.apply_patches(None).unwrap();
    assert!(original.patches().is_empty());
    assert_eq!(original.backing().state("a"), StorageState::MappedReadOnly);
    assert_eq!(variant.backing().state("a"), StorageState::Materialized);

    // The original resolves from the checkpoint, not from the variant's write
    let weight = original.materialize("a", None, false).unwrap();
    assert_eq!(weight.as_quantized().unwrap().block().bytes(), a_before.as_slice());
}

#[test]
fn test_revert_restores_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, store, mut handle) = open(&write_gguf(dir.path()));
    let before = stored_bytes(&store, "a");

    handle.add_patch(diff("a", 3.0));
    handle.first_load(&DevicePlan::all_on(Device::Cpu)).unwrap();
    assert!(store.read().unwrap().get("a").unwrap().is_dense());

    let report = handle.revert(None, true).unwrap();
    assert_eq!(report.restored, vec!["a".to_string()]);
    assert_eq!(stored_bytes(&store, "a"), before);
    // Revert never moves a record back to mapped
    assert_eq!(handle.backing().state("a"), StorageState::Materialized);
}

#[test]
fn test_revert_in_place_restores_dense_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.safetensors");
    let mut tensors = HashMap::new();
    let original = Tensor::new(&[[0.1f32, 0.2], [0.3, 0.4]], &Device::Cpu)
        .unwrap()
        .to_dtype(DType::F16)
        .unwrap();
    tensors.insert("w".to_string(), original.clone());
    candle_core::safetensors::save(&tensors, &path).unwrap();

    let checkpoint = Arc::new(Checkpoint::open(&path).unwrap());
    let mut store = ParameterStore::new();
    store.insert("w", Weight::Dense(original.clone()));
    let store = Arc::new(RwLock::new(store));
    let mut handle = PatchedModelHandle::new(&store, checkpoint, DeviceRoles::cpu());

    let delta = Tensor::full(1.0f32, (2, 2), &Device::Cpu).unwrap();
    handle.add_patch(Patch::new("w", Delta::Diff(delta)));
    handle.materialize("w", None, true).unwrap();
    assert!(handle.backing().backup("w").unwrap().in_place);

    handle.revert(None, true).unwrap();
    let restored = store.read().unwrap().weight("w").unwrap();
    let restored = restored.as_dense().unwrap();
    assert_eq!(restored.dtype(), DType::F16);
    let expected: Vec<half::f16> = original.flatten_all().unwrap().to_vec1().unwrap();
    let actual: Vec<half::f16> = restored.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(actual, expected);
}

#[test]
fn test_unregistered_kind_leaves_state_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, store, handle) = open(&write_gguf(dir.path()));
    let kernels = KernelRegistry::default().without_kernel(QuantKind::Q8_0);
    let mut handle = handle.with_context(PatchContext::default().with_kernels(kernels));
    handle.add_patch(diff("a", 1.0));
    let before = stored_bytes(&store, "a");

    let err = handle.materialize("a", None, false).unwrap_err();
    assert!(matches!(
        err,
        QuantPatchError::UnsupportedQuantKind { kind: QuantKind::Q8_0, .. }
    ));
    assert!(handle.backing().record("a").is_none());
    assert_eq!(stored_bytes(&store, "a"), before);

    // Fatal for a full pass as well
    let err = handle.first_load(&DevicePlan::all_on(Device::Cpu)).unwrap_err();
    assert!(err.is_fatal());
    assert!(!handle.backing().is_released());
}

#[test]
fn test_deferred_patches_and_unpatch() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, store, handle) = open(&write_gguf(dir.path()));
    let config = PatcherConfig {
        defer_quantized_patches: true,
        ..PatcherConfig::default()
    };
    let mut handle = handle.with_config(config);
    handle.add_patch(diff("a", 1.0));

    let report = handle.apply_patches(None).unwrap();
    assert_eq!(report.quantized, vec!["a".to_string()]);
    {
        let guard = store.read().unwrap();
        let a = guard.get("a").unwrap();
        assert!(a.as_quantized().unwrap().has_deferred());
        // Deferred patches merge when the host expands the weight
        assert_eq!(dense_values(a), shifted_base(&checkpoint, "a", 1.0));
    }

    handle.revert(None, true).unwrap();
    let guard = store.read().unwrap();
    assert!(guard.get("a").unwrap().as_quantized().unwrap().deferred().is_none());
}

#[test]
fn test_failed_patch_is_collected() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, _store, mut handle) = open_offloaded(&write_gguf(dir.path()));
    let wrong = Tensor::ones((3, 3), DType::F32, &Device::Cpu).unwrap();
    handle.add_patch(Patch::new("a", Delta::Diff(wrong)));
    handle.add_patch(diff("b", 1.0));

    let report = handle.first_load(&DevicePlan::all_on(Device::Cpu)).unwrap();
    assert_eq!(report.dense, vec!["b".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].1, QuantPatchError::IncompatibleShape { .. }));
    // `a` had no dense write, so the release pass picks it up
    assert_eq!(report.released, 1);
}

#[test]
fn test_deltas_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let (checkpoint, store, mut handle) = open(&write_gguf(dir.path()));

    let mut deltas = HashMap::new();
    deltas.insert(
        "b.lora_up.weight".to_string(),
        Tensor::ones((2, 1), DType::F32, &Device::Cpu).unwrap(),
    );
    deltas.insert(
        "b.lora_down.weight".to_string(),
        Tensor::ones((1, 32), DType::F32, &Device::Cpu).unwrap(),
    );
    deltas.insert(
        "missing.diff".to_string(),
        Tensor::ones((2, 32), DType::F32, &Device::Cpu).unwrap(),
    );
    let path = dir.path().join("deltas.safetensors");
    candle_core::safetensors::save(&deltas, &path).unwrap();

    let patches = load_deltas(&path, 0.5, &Device::Cpu).unwrap();
    assert_eq!(patches.len(), 2);
    assert_eq!(handle.add_patches(patches), vec!["b".to_string()]);

    handle.apply_patches(None).unwrap();
    let b = store.read().unwrap().weight("b").unwrap();
    assert_eq!(dense_values(&b), shifted_base(&checkpoint, "b", 0.5));
}

#[test]
fn test_dropped_store_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (_checkpoint, store, mut handle) = open(&write_gguf(dir.path()));
    handle.add_patch(diff("a", 1.0));
    drop(store);

    let err = handle.apply_patches(None).unwrap_err();
    assert!(matches!(err, QuantPatchError::ModelDropped));
}
