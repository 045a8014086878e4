//! Quantized block representation.

use std::sync::Arc;

use candle_core::quantized::GgmlDType;
use candle_core::DType;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

/// Storage format of a block payload
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuantKind {
    F32,
    F16,
    BF16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    /// Dot-product intermediate format, never stored by converters in practice
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
}

impl QuantKind {
    /// Every kind the container readers understand
    pub const ALL: [QuantKind; 15] = [
        QuantKind::F32,
        QuantKind::F16,
        QuantKind::BF16,
        QuantKind::Q4_0,
        QuantKind::Q4_1,
        QuantKind::Q5_0,
        QuantKind::Q5_1,
        QuantKind::Q8_0,
        QuantKind::Q8_1,
        QuantKind::Q2K,
        QuantKind::Q3K,
        QuantKind::Q4K,
        QuantKind::Q5K,
        QuantKind::Q6K,
        QuantKind::Q8K,
    ];

    /// Dense element type for unquantized kinds, `None` for block-quantized ones
    pub fn dense_dtype(&self) -> Option<DType> {
        match self {
            QuantKind::F32 => Some(DType::F32),
            QuantKind::F16 => Some(DType::F16),
            QuantKind::BF16 => Some(DType::BF16),
            _ => None,
        }
    }

    /// True for block formats with shared scale factors
    pub fn is_quantized(&self) -> bool {
        self.dense_dtype().is_none()
    }

    /// Matching GGML type
    pub fn ggml_dtype(&self) -> GgmlDType {
        match self {
            QuantKind::F32 => GgmlDType::F32,
            QuantKind::F16 => GgmlDType::F16,
            QuantKind::BF16 => GgmlDType::BF16,
            QuantKind::Q4_0 => GgmlDType::Q4_0,
            QuantKind::Q4_1 => GgmlDType::Q4_1,
            QuantKind::Q5_0 => GgmlDType::Q5_0,
            QuantKind::Q5_1 => GgmlDType::Q5_1,
            QuantKind::Q8_0 => GgmlDType::Q8_0,
            QuantKind::Q8_1 => GgmlDType::Q8_1,
            QuantKind::Q2K => GgmlDType::Q2K,
            QuantKind::Q3K => GgmlDType::Q3K,
            QuantKind::Q4K => GgmlDType::Q4K,
            QuantKind::Q5K => GgmlDType::Q5K,
            QuantKind::Q6K => GgmlDType::Q6K,
            QuantKind::Q8K => GgmlDType::Q8K,
        }
    }

    /// Number of elements sharing one scale group
    pub fn block_size(&self) -> usize {
        self.ggml_dtype().block_size()
    }

    /// Number of bytes per block
    pub fn type_size(&self) -> usize {
        self.ggml_dtype().type_size()
    }

    /// Payload size for `element_count` elements, `None` if the count does not
    /// divide into whole blocks
    pub fn byte_len(&self, element_count: usize) -> Option<usize> {
        let block_size = self.block_size();
        if element_count % block_size != 0 {
            return None;
        }
        Some(element_count / block_size * self.type_size())
    }
}

impl TryFrom<GgmlDType> for QuantKind {
    type Error = crate::QuantPatchError;

    fn try_from(dtype: GgmlDType) -> crate::Result<Self> {
        QuantKind::ALL
            .into_iter()
            .find(|kind| kind.ggml_dtype() == dtype)
            .ok_or_else(|| {
                crate::QuantPatchError::CorruptContainer(format!(
                    "Unknown tensor type {:?}",
                    dtype
                ))
            })
    }
}

/// Where the payload bytes live
#[derive(Clone)]
enum BlockBytes {
    /// Range of a shared file mapping
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
    /// Buffer owned by this block
    Owned(Vec<u8>),
}

/// One tensor's quantized payload plus metadata.
///
/// Blocks are immutable once constructed; every transformation produces a new
/// buffer. Handles share them through `Arc`.
#[derive(Clone)]
pub struct QuantizedBlock {
    /// Tensor identifier in the checkpoint
    name: String,
    /// Payload format
    kind: QuantKind,
    /// Logical (row-major) shape
    shape: Vec<usize>,
    /// Payload bytes
    bytes: BlockBytes,
}

impl QuantizedBlock {
    /// Create a block aliasing `len` bytes of a file mapping at `offset`
    pub fn mapped(
        name: impl Into<String>,
        kind: QuantKind,
        shape: Vec<usize>,
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    ) -> crate::Result<Self> {
        let name = name.into();
        let end = offset.checked_add(len).filter(|end| *end <= map.len());
        if end.is_none() {
            return Err(crate::QuantPatchError::CorruptContainer(format!(
                "Tensor {} spans {}..{} past end of mapping ({} bytes)",
                name,
                offset,
                offset.saturating_add(len),
                map.len()
            )));
        }
        Self::validate(&name, kind, &shape, len)?;

        Ok(Self {
            name,
            kind,
            shape,
            bytes: BlockBytes::Mapped { map, offset, len },
        })
    }

    /// Create a block that owns its payload
    pub fn owned(
        name: impl Into<String>,
        kind: QuantKind,
        shape: Vec<usize>,
        data: Vec<u8>,
    ) -> crate::Result<Self> {
        let name = name.into();
        Self::validate(&name, kind, &shape, data.len())?;

        Ok(Self {
            name,
            kind,
            shape,
            bytes: BlockBytes::Owned(data),
        })
    }

    fn validate(name: &str, kind: QuantKind, shape: &[usize], len: usize) -> crate::Result<()> {
        let numel: usize = shape.iter().product();
        match kind.byte_len(numel) {
            Some(expected) if expected == len => Ok(()),
            Some(expected) => Err(crate::QuantPatchError::CorruptContainer(format!(
                "Tensor {} ({:?}, shape {:?}) has {} bytes, expected {}",
                name, kind, shape, len, expected
            ))),
            None => Err(crate::QuantPatchError::CorruptContainer(format!(
                "Tensor {} has {} elements, not a multiple of the {:?} block size {}",
                name,
                numel,
                kind,
                kind.block_size()
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> QuantKind {
        self.kind
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of elements in the logical tensor
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Raw payload
    pub fn bytes(&self) -> &[u8] {
        match &self.bytes {
            BlockBytes::Mapped { map, offset, len } => &map[*offset..*offset + *len],
            BlockBytes::Owned(data) => data,
        }
    }

    /// Payload size in bytes
    pub fn byte_len(&self) -> usize {
        match &self.bytes {
            BlockBytes::Mapped { len, .. } => *len,
            BlockBytes::Owned(data) => data.len(),
        }
    }

    /// Whether the payload still aliases a file mapping
    pub fn is_mapped(&self) -> bool {
        matches!(self.bytes, BlockBytes::Mapped { .. })
    }

    /// Same tensor backed by `data` instead of the current payload.
    ///
    /// `data` must have the same length as the current payload.
    pub fn with_owned_bytes(&self, data: Vec<u8>) -> crate::Result<Self> {
        Self::owned(self.name.clone(), self.kind, self.shape.clone(), data)
    }

    /// Copy the payload into a freshly allocated buffer.
    ///
    /// Allocation failure is reported instead of aborting, since this runs for
    /// every weight of a model that may already fill host memory.
    pub fn detached_copy(&self) -> crate::Result<Self> {
        let src = self.bytes();
        let mut data = Vec::new();
        data.try_reserve_exact(src.len())
            .map_err(|e| crate::QuantPatchError::DeviceTransfer {
                name: self.name.clone(),
                reason: format!("Cannot allocate {} bytes: {}", src.len(), e),
            })?;
        data.extend_from_slice(src);
        self.with_owned_bytes(data)
    }
}

impl std::fmt::Debug for QuantizedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedBlock")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("shape", &self.shape)
            .field("bytes", &self.byte_len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
