//! Configuration for patch handles and checkpoint storage roots.

mod patcher_config;
mod storage;

pub use patcher_config::PatcherConfig;
pub use storage::{StorageConfig, StorageRoot};
