//! The patched model handle exposed to the host runtime.

use std::sync::{Arc, RwLock, RwLockWriteGuard, Weak};

use candle_core::Device;

use super::backing::{BackingStoreLifecycle, ReleaseReport, ReleaseScope};
use super::materializer::WeightMaterializer;
use super::store::{Weight, WeightStore, WriteMode};
use super::{DevicePlan, DeviceRoles, PatchContext};
use crate::checkpoint::Checkpoint;
use crate::config::PatcherConfig;
use crate::patch::{Patch, PatchSet, SeededRounder};

/// Outcome of a pass over many weights
#[derive(Debug, Default)]
pub struct PassReport {
    /// Weights written as dense tensors
    pub dense: Vec<String>,
    /// Weights left quantized
    pub quantized: Vec<String>,
    /// Weights that failed, with the reason
    pub failures: Vec<(String, crate::QuantPatchError)>,
    /// Weights moved off the file mapping by the release pass
    pub released: usize,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a revert
#[derive(Debug, Default)]
pub struct RevertReport {
    /// Weights written back from their backup
    pub restored: Vec<String>,
    /// Weights whose restore failed; their backups are kept for a retry
    pub failures: Vec<(String, crate::QuantPatchError)>,
}

impl RevertReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Patch state for one variant of a model.
///
/// The handle owns its patches and backing records; the checkpoint and the
/// collaborators are shared with every clone. The host model is only
/// referenced weakly, so a handle never keeps a dropped model alive.
pub struct PatchedModelHandle<S: WeightStore> {
    store: Weak<RwLock<S>>,
    checkpoint: Arc<Checkpoint>,
    context: PatchContext,
    config: PatcherConfig,
    devices: DeviceRoles,
    release: ReleaseScope,
    patches: PatchSet,
    backing: BackingStoreLifecycle,
}

impl<S: WeightStore> PatchedModelHandle<S> {
    pub fn new(store: &Arc<RwLock<S>>, checkpoint: Arc<Checkpoint>, devices: DeviceRoles) -> Self {
        Self {
            store: Arc::downgrade(store),
            checkpoint,
            context: PatchContext::default(),
            config: PatcherConfig::default(),
            release: ReleaseScope::new(&devices),
            devices,
            patches: PatchSet::new(),
            backing: BackingStoreLifecycle::new(),
        }
    }

    /// Apply a config; the rounder is reseeded from `rounding_seed`
    pub fn with_config(mut self, config: PatcherConfig) -> Self {
        self.context.rounder = Arc::new(SeededRounder::new(config.rounding_seed));
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: PatchContext) -> Self {
        self.context = context;
        self
    }

    /// Override which devices the mmap release pass treats as in use
    pub fn with_release_scope(mut self, scope: ReleaseScope) -> Self {
        self.release = scope;
        self
    }

    pub fn checkpoint(&self) -> &Arc<Checkpoint> {
        &self.checkpoint
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceRoles {
        &self.devices
    }

    pub fn patches(&self) -> &PatchSet {
        &self.patches
    }

    pub fn backing(&self) -> &BackingStoreLifecycle {
        &self.backing
    }

    /// Whether the host model is still alive
    pub fn is_attached(&self) -> bool {
        self.store.strong_count() > 0
    }

    /// Queue a patch; patches for weights the checkpoint lacks are ignored
    pub fn add_patch(&mut self, patch: Patch) -> bool {
        if !self.checkpoint.contains(patch.key()) {
            tracing::debug!("Ignoring patch for unknown weight {}", patch.key());
            return false;
        }
        self.patches.add(patch);
        true
    }

    /// Queue several patches, returning the keys that were accepted
    pub fn add_patches(&mut self, patches: impl IntoIterator<Item = Patch>) -> Vec<String> {
        let mut accepted: Vec<String> = Vec::new();
        for patch in patches {
            let key = patch.key().to_string();
            if self.add_patch(patch) && !accepted.contains(&key) {
                accepted.push(key);
            }
        }
        accepted
    }

    /// Drop the queued patches for one weight; the stored value is unchanged
    /// until the weight is materialized again or reverted
    pub fn clear_patches(&mut self, key: &str) -> Vec<Patch> {
        self.patches.clear(key)
    }

    pub fn clear_all_patches(&mut self) {
        self.patches.clear_all();
    }

    /// Materialize one weight onto `target` (the weight's current device if
    /// `None`) in the configured compute dtype
    pub fn materialize(
        &mut self,
        key: &str,
        target: Option<&Device>,
        in_place: bool,
    ) -> crate::Result<Weight> {
        let dtype = self.config.compute_dtype()?;
        let store = self.upgrade()?;
        let mut guard = lock(&store)?;

        WeightMaterializer::new(
            &self.checkpoint,
            &self.patches,
            &self.context,
            &self.config,
            &self.devices,
        )
        .materialize(&mut *guard, &mut self.backing, key, target, dtype, in_place)
    }

    /// Materialize every weight with queued patches
    pub fn apply_patches(&mut self, device_to: Option<&Device>) -> crate::Result<PassReport> {
        let keys = self.patches.keys();
        tracing::info!("Applying patches to {} weights", keys.len());
        self.run_pass(&keys, |_| device_to.cloned())
    }

    /// Full load: materialize every checkpoint weight the host holds, then
    /// release the file mapping.
    ///
    /// Every weight goes through the materializer, patched or not.
    pub fn first_load(&mut self, plan: &DevicePlan) -> crate::Result<PassReport> {
        let keys: Vec<String> = {
            let store = self.upgrade()?;
            let guard = store.read().map_err(|_| crate::QuantPatchError::StorePoisoned)?;
            let keys: Vec<String> = guard
                .keys()
                .into_iter()
                .filter(|key| self.checkpoint.contains(key))
                .collect();
            keys
        };
        tracing::info!("First load of {} weights", keys.len());

        let mut report = self.run_pass(&keys, |key| Some(plan.device_for(key).clone()))?;
        let released = self.release_mapped_regions()?;
        report.released = released.released;
        report.failures.extend(released.failures);
        Ok(report)
    }

    /// Detach the weights in use from the file mapping; only the first call
    /// per handle does anything
    pub fn release_mapped_regions(&mut self) -> crate::Result<ReleaseReport> {
        let store = self.upgrade()?;
        let mut guard = lock(&store)?;
        Ok(self.backing.release_mapped_regions(
            &mut *guard,
            &self.checkpoint,
            self.context.transfer.as_ref(),
            &self.release,
        ))
    }

    /// Undo materialization.
    ///
    /// With `unpatch_weights`, deferred patches are stripped from quantized
    /// weights and every backup is written back the way it was taken. A
    /// backup is dropped only once its write succeeds; a failed write is
    /// collected and the rest are still restored. The store's own `unpatch`
    /// hook runs either way.
    pub fn revert(
        &mut self,
        device_to: Option<&Device>,
        unpatch_weights: bool,
    ) -> crate::Result<RevertReport> {
        let store = self.upgrade()?;
        let mut guard = lock(&store)?;
        let mut report = RevertReport::default();

        if unpatch_weights {
            for key in guard.keys() {
                let Some(Weight::Quantized(q)) = guard.weight(&key) else {
                    continue;
                };
                if q.deferred().is_none() {
                    continue;
                }
                let stripped = Weight::Quantized(q.without_deferred());
                match guard.set_weight(&key, stripped, WriteMode::Bind) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!("Failed to strip deferred patches from {}: {}", key, e);
                        report.failures.push((key, e));
                    }
                }
            }

            for key in self.backing.backup_keys() {
                let Some(backup) = self.backing.backup(&key).cloned() else {
                    continue;
                };
                let mode = backup.write_mode();
                match guard.set_weight(&key, backup.value, mode) {
                    Ok(()) => {
                        self.backing.clear_backup(&key);
                        report.restored.push(key);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!("Failed to restore {}: {}", key, e);
                        report.failures.push((key, e));
                    }
                }
            }
            tracing::info!(
                "Restored {} weights from backup, {} failed",
                report.restored.len(),
                report.failures.len()
            );
        }

        guard.unpatch(device_to)?;
        Ok(report)
    }

    /// Bytes currently held by the host's weights
    pub fn model_size(&self) -> crate::Result<usize> {
        let store = self.upgrade()?;
        let guard = store.read().map_err(|_| crate::QuantPatchError::StorePoisoned)?;
        let total = guard
            .keys()
            .iter()
            .filter_map(|key| guard.weight(key))
            .map(|weight| weight.byte_size())
            .sum();
        Ok(total)
    }

    fn run_pass(
        &mut self,
        keys: &[String],
        target: impl Fn(&str) -> Option<Device>,
    ) -> crate::Result<PassReport> {
        let mut report = PassReport::default();

        for key in keys {
            let device = target(key);
            match self.materialize(key, device.as_ref(), false) {
                Ok(Weight::Dense(_)) => report.dense.push(key.clone()),
                Ok(Weight::Quantized(_)) => report.quantized.push(key.clone()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to materialize {}: {}", key, e);
                    report.failures.push((key.clone(), e));
                }
            }
        }

        tracing::info!(
            "Pass done: {} dense, {} quantized, {} failed",
            report.dense.len(),
            report.quantized.len(),
            report.failures.len()
        );
        Ok(report)
    }

    fn upgrade(&self) -> crate::Result<Arc<RwLock<S>>> {
        self.store.upgrade().ok_or(crate::QuantPatchError::ModelDropped)
    }
}

fn lock<S>(store: &RwLock<S>) -> crate::Result<RwLockWriteGuard<'_, S>> {
    store.write().map_err(|_| crate::QuantPatchError::StorePoisoned)
}

impl<S: WeightStore> Clone for PatchedModelHandle<S> {
    /// Independent patches and records over the same checkpoint and host model
    fn clone(&self) -> Self {
        let mut backing = self.backing.clone();
        backing.reset_release();

        Self {
            store: self.store.clone(),
            checkpoint: self.checkpoint.clone(),
            context: self.context.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
            release: self.release.clone(),
            patches: self.patches.clone(),
            backing,
        }
    }
}

impl<S: WeightStore> std::fmt::Debug for PatchedModelHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchedModelHandle")
            .field("checkpoint", &self.checkpoint)
            .field("patched_weights", &self.patches.len())
            .field("mmap_released", &self.backing.is_released())
            .field("attached", &self.is_attached())
            .finish()
    }
}
