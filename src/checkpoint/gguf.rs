//! GGUF container reader.
//!
//! The header is parsed with candle's `gguf_file`; tensor payloads are never
//! read, only located, so every block aliases the file mapping.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use candle_core::quantized::gguf_file;
use memmap2::Mmap;

use crate::quantization::{QuantKind, QuantizedBlock};

/// Map a GGUF file and locate every tensor in it
pub(super) fn read_gguf(
    path: &Path,
) -> crate::Result<(BTreeMap<String, String>, Vec<QuantizedBlock>)> {
    let file = std::fs::File::open(path)?;
    let mmap = Arc::new(unsafe { Mmap::map(&file)? });

    let content = gguf_file::Content::read(&mut Cursor::new(&mmap[..])).map_err(|e| {
        crate::QuantPatchError::CorruptContainer(format!("{}: {}", path.display(), e))
    })?;

    let data_offset = content.tensor_data_offset;
    let mut blocks = Vec::with_capacity(content.tensor_infos.len());

    for (name, info) in &content.tensor_infos {
        let kind = QuantKind::try_from(info.ggml_dtype)?;
        let shape = info.shape.dims().to_vec();
        let len = kind.byte_len(info.shape.elem_count()).ok_or_else(|| {
            crate::QuantPatchError::CorruptContainer(format!(
                "Tensor {} with shape {:?} does not fill whole {:?} blocks",
                name, shape, kind
            ))
        })?;
        let offset = data_offset
            .checked_add(info.offset)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| {
                crate::QuantPatchError::CorruptContainer(format!(
                    "Tensor {} offset {} overflows",
                    name, info.offset
                ))
            })?;

        blocks.push(QuantizedBlock::mapped(
            name.clone(),
            kind,
            shape,
            mmap.clone(),
            offset,
            len,
        )?);
    }

    let metadata = content
        .metadata
        .iter()
        .filter_map(|(key, value)| describe(value).map(|v| (key.clone(), v)))
        .collect();

    Ok((metadata, blocks))
}

/// Render scalar metadata values; arrays (tokenizer tables and the like) are skipped
fn describe(value: &gguf_file::Value) -> Option<String> {
    use gguf_file::Value;

    let text = match value {
        Value::U8(v) => v.to_string(),
        Value::I8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::F32(v) => v.to_string(),
        Value::F64(v) => v.to_string(),
        Value::Bool(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Array(_) => return None,
    };
    Some(text)
}
