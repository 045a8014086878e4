//! Checkpoint containers backed by memory-mapped files.
//!
//! A `Checkpoint` is the immutable base every handle patches against. Its
//! blocks start out aliasing the file mapping; the mmap release pass swaps
//! each one for an owned copy of the same bytes, and the mapping is unmapped
//! once the last aliasing block is dropped.

mod gguf;
mod safetensors_file;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::quantization::QuantizedBlock;

/// On-disk format a checkpoint was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Gguf,
    Safetensors,
    /// Built in memory, no backing file
    Memory,
}

impl ContainerFormat {
    /// Detect the format from a file suffix
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "gguf" => Some(ContainerFormat::Gguf),
            "safetensors" | "sft" => Some(ContainerFormat::Safetensors),
            _ => None,
        }
    }
}

/// Base weights of a model, keyed by tensor identifier.
pub struct Checkpoint {
    /// Source file, if any
    path: Option<PathBuf>,
    /// Container format
    format: ContainerFormat,
    /// Scalar header metadata
    metadata: BTreeMap<String, String>,
    /// Blocks by tensor identifier
    blocks: RwLock<BTreeMap<String, Arc<QuantizedBlock>>>,
}

impl Checkpoint {
    /// Open a checkpoint file, choosing the reader by suffix
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let format = ContainerFormat::from_path(path).ok_or_else(|| {
            crate::QuantPatchError::CorruptContainer(format!(
                "Unrecognized checkpoint suffix: {}",
                path.display()
            ))
        })?;

        tracing::debug!("Opening {:?} checkpoint {:?}", format, path);

        let (metadata, blocks) = match format {
            ContainerFormat::Gguf => gguf::read_gguf(path)?,
            ContainerFormat::Safetensors => safetensors_file::read_safetensors(path)?,
            ContainerFormat::Memory => {
                return Err(crate::QuantPatchError::CorruptContainer(format!(
                    "No reader for {}",
                    path.display()
                )))
            }
        };

        let checkpoint = Self::build(Some(path.to_path_buf()), format, metadata, blocks);
        tracing::info!(
            "Loaded {} tensors ({} bytes) from {:?}",
            checkpoint.len(),
            checkpoint.total_bytes(),
            path
        );
        Ok(checkpoint)
    }

    /// Build an in-memory checkpoint
    pub fn from_blocks(blocks: Vec<QuantizedBlock>) -> Self {
        Self::build(None, ContainerFormat::Memory, BTreeMap::new(), blocks)
    }

    fn build(
        path: Option<PathBuf>,
        format: ContainerFormat,
        metadata: BTreeMap<String, String>,
        blocks: Vec<QuantizedBlock>,
    ) -> Self {
        let blocks = blocks
            .into_iter()
            .map(|block| (block.name().to_string(), Arc::new(block)))
            .collect();

        Self {
            path,
            format,
            metadata,
            blocks: RwLock::new(blocks),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Get the block for a tensor
    pub fn block(&self, name: &str) -> Option<Arc<QuantizedBlock>> {
        self.read_blocks().get(name).cloned()
    }

    /// Tensor identifiers in sorted order
    pub fn names(&self) -> Vec<String> {
        self.read_blocks().keys().cloned().collect()
    }

    /// All blocks in identifier order
    pub fn blocks(&self) -> Vec<Arc<QuantizedBlock>> {
        self.read_blocks().values().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_blocks().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read_blocks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_blocks().is_empty()
    }

    /// Total payload size
    pub fn total_bytes(&self) -> usize {
        self.read_blocks().values().map(|b| b.byte_len()).sum()
    }

    /// Number of blocks still aliasing the file mapping
    pub fn mapped_blocks(&self) -> usize {
        self.read_blocks().values().filter(|b| b.is_mapped()).count()
    }

    /// Swap a mapped block for an owned copy of the same payload.
    ///
    /// Returns the block now stored for `name`. If another handle already
    /// detached it, the existing owned block wins so every alias converges on
    /// one buffer.
    pub(crate) fn replace_detached(
        &self,
        name: &str,
        owned: Arc<QuantizedBlock>,
    ) -> crate::Result<Arc<QuantizedBlock>> {
        let mut blocks = self
            .blocks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let slot = blocks
            .get_mut(name)
            .ok_or_else(|| crate::QuantPatchError::MissingWeight(name.to_string()))?;

        if !slot.is_mapped() {
            return Ok(slot.clone());
        }
        if slot.kind() != owned.kind() || slot.shape() != owned.shape() || owned.is_mapped() {
            return Err(crate::QuantPatchError::DeviceTransfer {
                name: name.to_string(),
                reason: "Detached copy does not match the mapped block".to_string(),
            });
        }

        *slot = owned.clone();
        Ok(owned)
    }

    // Blocks are immutable, so a panic while the lock was held cannot have
    // left the map half-updated.
    fn read_blocks(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<QuantizedBlock>>> {
        self.blocks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("num_tensors", &self.len())
            .field("mapped", &self.mapped_blocks())
            .finish()
    }
}
