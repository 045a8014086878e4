//! Safetensors container reader for unquantized checkpoints.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use safetensors::SafeTensors;

use crate::quantization::{QuantKind, QuantizedBlock};

/// Map a safetensors file and locate its floating-point tensors
pub(super) fn read_safetensors(
    path: &Path,
) -> crate::Result<(BTreeMap<String, String>, Vec<QuantizedBlock>)> {
    let file = std::fs::File::open(path)?;
    let mmap = Arc::new(unsafe { Mmap::map(&file)? });

    let corrupt = |e: safetensors::SafeTensorError| {
        crate::QuantPatchError::CorruptContainer(format!("{}: {}", path.display(), e))
    };

    let (_, header) = SafeTensors::read_metadata(&mmap[..]).map_err(corrupt)?;
    let metadata = header
        .metadata()
        .as_ref()
        .map(|meta| meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let tensors = SafeTensors::deserialize(&mmap[..]).map_err(corrupt)?;
    let base = mmap.as_ptr() as usize;
    let mut blocks = Vec::new();

    for (name, view) in tensors.tensors() {
        let kind = match convert_safetensor_dtype(view.dtype()) {
            Some(kind) => kind,
            None => {
                tracing::warn!("Skipping {} with unsupported dtype {:?}", name, view.dtype());
                continue;
            }
        };

        // Views borrow straight from the mapping
        let data = view.data();
        let offset = data.as_ptr() as usize - base;

        blocks.push(QuantizedBlock::mapped(
            name,
            kind,
            view.shape().to_vec(),
            mmap.clone(),
            offset,
            data.len(),
        )?);
    }

    Ok((metadata, blocks))
}

/// Convert safetensor dtype to a payload kind
fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> Option<QuantKind> {
    match dtype {
        safetensors::Dtype::F32 => Some(QuantKind::F32),
        safetensors::Dtype::F16 => Some(QuantKind::F16),
        safetensors::Dtype::BF16 => Some(QuantKind::BF16),
        _ => None,
    }
}
