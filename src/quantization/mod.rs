//! Quantized payloads and the kernels that expand them.
//!
//! - `QuantizedBlock`: immutable payload plus shape/format metadata
//! - `KernelRegistry`: which formats can be dequantized, and which the host can
//!   consume directly without expansion
//! - `DequantizationGate`: per-access decision between the two

mod block;
mod gate;
mod kernels;

pub use block::{QuantKind, QuantizedBlock};
pub use gate::{DequantizationGate, GateRequest, Resolved};
pub use kernels::{GgmlKernel, RawKernel};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use candle_core::{DType, Tensor};

/// Trait for dequantization implementations
pub trait DequantKernel: Send + Sync {
    /// Expand a block into a new host tensor of `dtype` with the block's shape
    fn dequantize(&self, block: &QuantizedBlock, dtype: DType) -> crate::Result<Tensor>;
}

/// Registry of dequantization kernels keyed by payload format.
#[derive(Clone)]
pub struct KernelRegistry {
    /// Kernels able to expand a format
    kernels: HashMap<QuantKind, Arc<dyn DequantKernel>>,
    /// Formats the host can compute on without expanding them first
    direct: HashSet<QuantKind>,
}

impl KernelRegistry {
    /// Registry with no kernels at all
    pub fn empty() -> Self {
        Self {
            kernels: HashMap::new(),
            direct: HashSet::new(),
        }
    }

    /// Register a kernel for `kind`
    pub fn with_kernel(mut self, kind: QuantKind, kernel: Arc<dyn DequantKernel>) -> Self {
        self.kernels.insert(kind, kernel);
        self
    }

    /// Mark `kind` as directly consumable by the host's compute kernels
    pub fn with_direct_compute(mut self, kind: QuantKind) -> Self {
        self.direct.insert(kind);
        self
    }

    /// Drop direct-compute support for `kind`, forcing dense expansion on access
    pub fn without_direct_compute(mut self, kind: QuantKind) -> Self {
        self.direct.remove(&kind);
        self
    }

    /// Drop the kernel for `kind`
    pub fn without_kernel(mut self, kind: QuantKind) -> Self {
        self.kernels.remove(&kind);
        self.direct.remove(&kind);
        self
    }

    pub fn kernel_for(&self, kind: QuantKind) -> Option<Arc<dyn DequantKernel>> {
        self.kernels.get(&kind).cloned()
    }

    pub fn has_direct_compute(&self, kind: QuantKind) -> bool {
        self.direct.contains(&kind)
    }
}

impl Default for KernelRegistry {
    /// Raw kernels for dense formats, candle's GGML kernels for the storage
    /// block formats. Q8_1 and Q8K only exist as matmul intermediates and are
    /// left unregistered.
    fn default() -> Self {
        let raw: Arc<dyn DequantKernel> = Arc::new(RawKernel);
        let ggml: Arc<dyn DequantKernel> = Arc::new(GgmlKernel);

        let mut registry = Self::empty();
        for kind in QuantKind::ALL {
            let kernel = match kind {
                QuantKind::Q8_1 | QuantKind::Q8K => continue,
                QuantKind::F32 | QuantKind::F16 | QuantKind::BF16 => raw.clone(),
                _ => ggml.clone(),
            };
            registry = registry.with_kernel(kind, kernel).with_direct_compute(kind);
        }
        registry
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kernels.keys().collect();
        kinds.sort();
        f.debug_struct("KernelRegistry")
            .field("kernels", &kinds)
            .field("direct", &self.direct.len())
            .finish()
    }
}
