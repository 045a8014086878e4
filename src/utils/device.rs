//! Device and data type utilities.
//!
//! `DeviceTransfer` is the seam between the patcher and the device allocator:
//! every tensor copy and every mmap detach goes through it, so hosts with
//! their own allocator can substitute one.

use candle_core::{DType, Device, Tensor};

use crate::quantization::QuantizedBlock;

/// Moves tensors and payloads between devices
pub trait DeviceTransfer: Send + Sync {
    /// Copy `tensor` onto `device`; a tensor already there is returned as-is
    fn to_device(&self, name: &str, tensor: &Tensor, device: &Device) -> crate::Result<Tensor>;

    /// Copy a block's payload into owned host memory, staging it through `via`.
    ///
    /// The result no longer aliases any file mapping.
    fn detach_block(&self, block: &QuantizedBlock, via: &Device) -> crate::Result<QuantizedBlock>;
}

/// Transfers through candle's device copies
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleTransfer;

impl DeviceTransfer for CandleTransfer {
    fn to_device(&self, name: &str, tensor: &Tensor, device: &Device) -> crate::Result<Tensor> {
        if tensor.device().same_device(device) {
            return Ok(tensor.clone());
        }
        tensor
            .to_device(device)
            .map_err(|e| transfer_error(name, e))
    }

    fn detach_block(&self, block: &QuantizedBlock, via: &Device) -> crate::Result<QuantizedBlock> {
        if via.is_cpu() {
            return block.detached_copy();
        }

        let staged = Tensor::from_raw_buffer(block.bytes(), DType::U8, &[block.byte_len()], via)
            .map_err(|e| transfer_error(block.name(), e))?;
        let data: Vec<u8> = staged
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_vec1())
            .map_err(|e| transfer_error(block.name(), e))?;
        block.with_owned_bytes(data)
    }
}

fn transfer_error(name: &str, err: candle_core::Error) -> crate::QuantPatchError {
    crate::QuantPatchError::DeviceTransfer {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

/// Get the best available device (CUDA > Metal > CPU)
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    #[cfg(feature = "cuda")]
    {
        let id = device_id.unwrap_or(0);
        match Device::new_cuda(id) {
            Ok(device) => {
                tracing::info!("Using CUDA device {}", id);
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("CUDA not available: {}", e);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(device_id.unwrap_or(0)) {
            Ok(device) => {
                tracing::info!("Using Metal device");
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("Metal not available: {}", e);
            }
        }
    }

    let _ = device_id;
    tracing::info!("Using CPU device");
    Ok(Device::Cpu)
}

/// Parse a device string: `cpu`, `auto`, `cuda[:N]` or `metal[:N]`
pub fn parse_device(value: &str) -> crate::Result<Device> {
    let value = value.trim().to_lowercase();
    let (name, ordinal) = match value.split_once(':') {
        Some((name, id)) => {
            let id = id.parse::<usize>().map_err(|_| {
                crate::QuantPatchError::Config(format!("Invalid device ordinal in '{}'", value))
            })?;
            (name.to_string(), Some(id))
        }
        None => (value.clone(), None),
    };

    match name.as_str() {
        "cpu" => Ok(Device::Cpu),
        "auto" => get_device(ordinal),
        "cuda" => Device::new_cuda(ordinal.unwrap_or(0)).map_err(Into::into),
        "metal" => Device::new_metal(ordinal.unwrap_or(0)).map_err(Into::into),
        _ => Err(crate::QuantPatchError::Config(format!(
            "Unknown device '{}'",
            value
        ))),
    }
}

/// Parse dtype string to candle DType
pub fn parse_dtype(dtype_str: &str) -> crate::Result<DType> {
    match dtype_str.to_lowercase().as_str() {
        "f32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        "f64" | "float64" | "double" => Ok(DType::F64),
        _ => Err(crate::QuantPatchError::Config(format!(
            "Unknown dtype '{}'",
            dtype_str
        ))),
    }
}
