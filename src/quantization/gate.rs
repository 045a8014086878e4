//! Decides whether a weight access can keep its quantized payload.

use std::sync::Arc;

use candle_core::{DType, Tensor};

use super::{KernelRegistry, QuantizedBlock};

/// Outcome of resolving a block for one access
#[derive(Debug, Clone)]
pub enum Resolved {
    /// The host consumes the payload as-is
    StillQuantized(Arc<QuantizedBlock>),
    /// A new host tensor, expanded to the requested dtype
    Dense(Tensor, DType),
}

impl Resolved {
    pub fn is_dense(&self) -> bool {
        matches!(self, Resolved::Dense(..))
    }
}

/// What the caller needs from one access
#[derive(Debug, Clone, Copy)]
pub struct GateRequest {
    /// Precision for a dense result
    pub dtype: DType,
    /// Whether the weight has pending patches
    pub has_patches: bool,
    /// Leave patched block formats quantized, merging patches at compute time
    pub defer_patches: bool,
}

impl GateRequest {
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype,
            has_patches: false,
            defer_patches: false,
        }
    }

    pub fn with_patches(mut self, has_patches: bool) -> Self {
        self.has_patches = has_patches;
        self
    }

    pub fn deferring(mut self, defer_patches: bool) -> Self {
        self.defer_patches = defer_patches;
        self
    }
}

/// Pure keep-or-expand decision over a `KernelRegistry`.
#[derive(Debug, Clone, Copy)]
pub struct DequantizationGate<'a> {
    registry: &'a KernelRegistry,
}

impl<'a> DequantizationGate<'a> {
    pub fn new(registry: &'a KernelRegistry) -> Self {
        Self { registry }
    }

    /// Keep the block quantized when the host has a direct-compute kernel for
    /// it and nothing needs merging; otherwise expand it.
    ///
    /// A block whose format has no dequantization kernel is rejected even on
    /// the quantized path: the weight could never be patched or restored.
    pub fn resolve(&self, block: &Arc<QuantizedBlock>, request: GateRequest) -> crate::Result<Resolved> {
        let kernel = self.registry.kernel_for(block.kind()).ok_or_else(|| {
            crate::QuantPatchError::UnsupportedQuantKind {
                name: block.name().to_string(),
                kind: block.kind(),
            }
        })?;

        let deferrable = request.defer_patches && block.kind().is_quantized();
        let keep = self.registry.has_direct_compute(block.kind())
            && (!request.has_patches || deferrable);

        if keep {
            return Ok(Resolved::StillQuantized(block.clone()));
        }

        tracing::trace!("Expanding {} ({:?}) to {:?}", block.name(), block.kind(), request.dtype);
        let tensor = kernel.dequantize(block, request.dtype)?;
        Ok(Resolved::Dense(tensor, request.dtype))
    }
}
