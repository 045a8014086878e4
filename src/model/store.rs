//! Host-facing weight values and the store contract.

use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::{DType, Device, DeviceLocation, Tensor};

use crate::checkpoint::Checkpoint;
use crate::patch::{Patch, WeightCombiner};
use crate::quantization::{KernelRegistry, QuantizedBlock};

/// Patches carried by a still-quantized weight, merged when it is expanded
#[derive(Debug, Clone)]
pub struct DeferredPatches {
    pub key: String,
    pub patches: Vec<Patch>,
}

/// A weight the host consumes in its quantized form
#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    block: Arc<QuantizedBlock>,
    /// Device the host computes this weight on
    device: Device,
    deferred: Option<DeferredPatches>,
}

impl QuantizedWeight {
    pub fn new(block: Arc<QuantizedBlock>, device: Device) -> Self {
        Self {
            block,
            device,
            deferred: None,
        }
    }

    pub fn with_deferred(mut self, patches: Vec<Patch>) -> Self {
        self.deferred = Some(DeferredPatches {
            key: self.block.name().to_string(),
            patches,
        });
        self
    }

    pub fn without_deferred(mut self) -> Self {
        self.deferred = None;
        self
    }

    /// Same weight backed by another block
    pub fn with_block(mut self, block: Arc<QuantizedBlock>) -> Self {
        self.block = block;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn block(&self) -> &Arc<QuantizedBlock> {
        &self.block
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn deferred(&self) -> Option<&DeferredPatches> {
        self.deferred.as_ref()
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred
            .as_ref()
            .is_some_and(|d| !d.patches.is_empty())
    }

    /// Expand to a dense tensor on this weight's device, merging any deferred
    /// patches
    pub fn dequantize(
        &self,
        kernels: &KernelRegistry,
        combiner: &dyn WeightCombiner,
        dtype: DType,
    ) -> crate::Result<Tensor> {
        let kernel = kernels.kernel_for(self.block.kind()).ok_or_else(|| {
            crate::QuantPatchError::UnsupportedQuantKind {
                name: self.block.name().to_string(),
                kind: self.block.kind(),
            }
        })?;

        let tensor = kernel.dequantize(&self.block, dtype)?.to_device(&self.device)?;
        match &self.deferred {
            Some(deferred) if !deferred.patches.is_empty() => {
                combiner.combine(&deferred.key, tensor, &deferred.patches)
            }
            _ => Ok(tensor),
        }
    }
}

/// A weight as held by the host
#[derive(Debug, Clone)]
pub enum Weight {
    Quantized(QuantizedWeight),
    Dense(Tensor),
}

impl Weight {
    pub fn device(&self) -> &Device {
        match self {
            Weight::Quantized(q) => q.device(),
            Weight::Dense(t) => t.device(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Weight::Quantized(q) => q.block().shape(),
            Weight::Dense(t) => t.dims(),
        }
    }

    /// Bytes held for this weight
    pub fn byte_size(&self) -> usize {
        match self {
            Weight::Quantized(q) => q.block().byte_len(),
            Weight::Dense(t) => t.elem_count() * t.dtype().size_in_bytes(),
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, Weight::Dense(_))
    }

    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Weight::Dense(t) => Some(t),
            Weight::Quantized(_) => None,
        }
    }

    pub fn as_quantized(&self) -> Option<&QuantizedWeight> {
        match self {
            Weight::Quantized(q) => Some(q),
            Weight::Dense(_) => None,
        }
    }
}

/// How a new value replaces the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Overwrite the existing parameter's storage, keeping its dtype and device
    InPlace,
    /// Bind the value as a new parameter
    Bind,
}

/// Capabilities the patcher needs from a host model.
///
/// Implementations decide how weights are stored; the patcher only reads,
/// writes, and enumerates them by tensor identifier.
pub trait WeightStore {
    fn weight(&self, key: &str) -> Option<Weight>;

    fn set_weight(&mut self, key: &str, weight: Weight, mode: WriteMode) -> crate::Result<()>;

    fn keys(&self) -> Vec<String>;

    fn device_of(&self, key: &str) -> Option<Device> {
        self.weight(key).map(|w| w.device().clone())
    }

    /// Location tag of the device a weight is resident on
    fn device_tag(&self, key: &str) -> Option<DeviceLocation> {
        self.device_of(key).map(|d| d.location())
    }

    /// Called at the end of every revert
    fn unpatch(&mut self, _device_to: Option<&Device>) -> crate::Result<()> {
        Ok(())
    }
}

/// In-memory weight store
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    weights: BTreeMap<String, Weight>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store every checkpoint block as a quantized weight tagged with `device`
    pub fn from_checkpoint(checkpoint: &Checkpoint, device: &Device) -> Self {
        let weights = checkpoint
            .blocks()
            .into_iter()
            .map(|block| {
                let name = block.name().to_string();
                (name, Weight::Quantized(QuantizedWeight::new(block, device.clone())))
            })
            .collect();
        Self { weights }
    }

    pub fn insert(&mut self, key: impl Into<String>, weight: Weight) -> Option<Weight> {
        self.weights.insert(key.into(), weight)
    }

    pub fn get(&self, key: &str) -> Option<&Weight> {
        self.weights.get(key)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl WeightStore for ParameterStore {
    fn weight(&self, key: &str) -> Option<Weight> {
        self.weights.get(key).cloned()
    }

    fn set_weight(&mut self, key: &str, weight: Weight, mode: WriteMode) -> crate::Result<()> {
        if mode == WriteMode::Bind {
            self.weights.insert(key.to_string(), weight);
            return Ok(());
        }

        let existing = self.weights.get(key).ok_or_else(|| {
            crate::QuantPatchError::WeightStore(format!("No parameter {} to update in place", key))
        })?;
        if existing.shape() != weight.shape() {
            return Err(crate::QuantPatchError::IncompatibleShape {
                name: key.to_string(),
                expected: existing.shape().to_vec(),
                actual: weight.shape().to_vec(),
            });
        }

        let value = match (existing, weight) {
            (Weight::Dense(current), Weight::Dense(new)) => Weight::Dense(
                new.to_dtype(current.dtype())?
                    .to_device(current.device())?,
            ),
            (_, other) => other,
        };
        self.weights.insert(key.to_string(), value);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.weights.keys().cloned().collect()
    }

    fn unpatch(&mut self, device_to: Option<&Device>) -> crate::Result<()> {
        let Some(device) = device_to else {
            return Ok(());
        };

        for weight in self.weights.values_mut() {
            let moved = match &*weight {
                Weight::Dense(t) => Weight::Dense(t.to_device(device)?),
                Weight::Quantized(q) => Weight::Quantized(q.clone().with_device(device.clone())),
            };
            *weight = moved;
        }
        Ok(())
    }
}

/// Read back a weight as a dense tensor in `dtype`, whatever form it is held in
pub fn dense_value(
    weight: &Weight,
    kernels: &KernelRegistry,
    combiner: &dyn WeightCombiner,
    dtype: DType,
) -> crate::Result<Tensor> {
    match weight {
        Weight::Dense(t) => t.to_dtype(dtype).map_err(Into::into),
        Weight::Quantized(q) => q.dequantize(kernels, combiner, dtype),
    }
}
