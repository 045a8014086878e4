//! Built-in dequantization kernels.
//!
//! - `RawKernel` reinterprets unquantized payloads (F32/F16/BF16) in place
//! - `GgmlKernel` expands GGML block formats through candle's quantized kernels

use candle_core::quantized::ggml_file;
use candle_core::{DType, Device, Tensor};

use super::{DequantKernel, QuantizedBlock};

/// Kernel for unquantized payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct RawKernel;

impl DequantKernel for RawKernel {
    fn dequantize(&self, block: &QuantizedBlock, dtype: DType) -> crate::Result<Tensor> {
        let source = block.kind().dense_dtype().ok_or_else(|| {
            crate::QuantPatchError::UnsupportedQuantKind {
                name: block.name().to_string(),
                kind: block.kind(),
            }
        })?;

        let tensor = Tensor::from_raw_buffer(block.bytes(), source, block.shape(), &Device::Cpu)
            .map_err(|e| corrupt(block, e))?;

        tensor.to_dtype(dtype).map_err(Into::into)
    }
}

/// Kernel for GGML block-quantized payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct GgmlKernel;

impl DequantKernel for GgmlKernel {
    fn dequantize(&self, block: &QuantizedBlock, dtype: DType) -> crate::Result<Tensor> {
        let qtensor = ggml_file::qtensor_from_ggml(
            block.kind().ggml_dtype(),
            block.bytes(),
            block.shape().to_vec(),
            &Device::Cpu,
        )
        .map_err(|e| corrupt(block, e))?;

        // Always expands to f32 first
        let tensor = qtensor.dequantize(&Device::Cpu)?;
        tensor.to_dtype(dtype).map_err(Into::into)
    }
}

fn corrupt(block: &QuantizedBlock, err: candle_core::Error) -> crate::QuantPatchError {
    crate::QuantPatchError::CorruptContainer(format!(
        "Cannot decode {} as {:?}: {}",
        block.name(),
        block.kind(),
        err
    ))
}
