//! # rs-quantpatch
//!
//! Lazy dequantization and patch management for block-quantized checkpoints.
//!
//! ## Core Concept
//!
//! Large checkpoints (GGUF, safetensors) are memory-mapped and handed to a host
//! runtime as ordinary weights. Nothing is expanded up front:
//! - **Quantized blocks** stay as raw mapped bytes until a computation needs them
//! - **Patches** (fine-tuning deltas) are tracked per weight and merged on demand
//! - **Materialization** dequantizes a weight only when it is patched or when no
//!   direct-compute kernel exists for its format
//! - **Mmap release** copies the weights in use off the file mapping once, after
//!   the first full load, when load and offload are different devices
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::{Arc, RwLock};
//! use candle_core::Device;
//! use rs_quantpatch::{
//!     load_deltas, Checkpoint, DevicePlan, DeviceRoles, ParameterStore, PatchedModelHandle,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let checkpoint = Arc::new(Checkpoint::open("model.gguf")?);
//!     let store = Arc::new(RwLock::new(ParameterStore::from_checkpoint(&checkpoint, &Device::Cpu)));
//!     let mut handle = PatchedModelHandle::new(&store, checkpoint, DeviceRoles::cpu());
//!     handle.add_patches(load_deltas("style.safetensors", 0.8, &Device::Cpu)?);
//!     let report = handle.first_load(&DevicePlan::all_on(Device::Cpu))?;
//!     println!("released {} mapped weights", report.released);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod model;
pub mod patch;
pub mod quantization;
pub mod utils;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, ContainerFormat};
pub use config::{PatcherConfig, StorageConfig, StorageRoot};
pub use model::{
    BackingRecord, BackingStoreLifecycle, Backup, DevicePlan, DeviceRoles, ParameterStore,
    PassReport, PatchContext, PatchedModelHandle, QuantizedWeight, ReleaseReport, ReleaseScope,
    RevertReport, StorageState, Weight, WeightMaterializer, WeightStore, WriteMode,
};
pub use patch::{
    load_deltas, Delta, DeltaCombiner, Patch, PatchSet, SeededRounder, StochasticRounder,
    WeightCombiner,
};
pub use quantization::{
    DequantKernel, DequantizationGate, GateRequest, KernelRegistry, QuantKind, QuantizedBlock,
    Resolved,
};
pub use utils::{CandleTransfer, DeviceTransfer};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum QuantPatchError {
    #[error("No dequantization kernel registered for {kind:?} (tensor {name})")]
    UnsupportedQuantKind { name: String, kind: QuantKind },

    #[error("Device transfer failed for {name}: {reason}")]
    DeviceTransfer { name: String, reason: String },

    #[error("Patch application failed for {name}: {reason}")]
    PatchApplication { name: String, reason: String },

    #[error("Incompatible shape for {name}: expected {expected:?}, got {actual:?}")]
    IncompatibleShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Corrupt container: {0}")]
    CorruptContainer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Weight not found: {0}")]
    MissingWeight(String),

    #[error("Model was dropped by the host runtime")]
    ModelDropped,

    #[error("Weight store lock poisoned")]
    StorePoisoned,

    #[error("Weight store rejected write: {0}")]
    WeightStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuantPatchError {
    /// Whether this error must abort a full-model pass instead of being
    /// collected per tensor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QuantPatchError::UnsupportedQuantKind { .. }
                | QuantPatchError::CorruptContainer(_)
                | QuantPatchError::Io(_)
                | QuantPatchError::ModelDropped
                | QuantPatchError::StorePoisoned
        )
    }
}

pub type Result<T> = std::result::Result<T, QuantPatchError>;
