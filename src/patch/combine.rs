//! Merging patches into dense weights.

use candle_core::Tensor;

use super::{Delta, Patch};

/// Merges an ordered patch list into a dense base weight
pub trait WeightCombiner: Send + Sync {
    /// Apply `patches` to `base` in order, returning the merged weight in the
    /// base's dtype and device
    fn combine(&self, name: &str, base: Tensor, patches: &[Patch]) -> crate::Result<Tensor>;
}

/// Default combiner for `Delta` payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaCombiner;

impl WeightCombiner for DeltaCombiner {
    fn combine(&self, name: &str, base: Tensor, patches: &[Patch]) -> crate::Result<Tensor> {
        let mut weight = base;
        for patch in patches {
            weight = apply_patch(name, weight, patch).map_err(|e| match e {
                crate::QuantPatchError::Candle(inner) => crate::QuantPatchError::PatchApplication {
                    name: name.to_string(),
                    reason: inner.to_string(),
                },
                other => other,
            })?;
        }
        Ok(weight)
    }
}

fn apply_patch(name: &str, weight: Tensor, patch: &Patch) -> crate::Result<Tensor> {
    let dtype = weight.dtype();
    let device = weight.device().clone();
    let strength = patch.strength();

    match patch.delta() {
        Delta::Diff(diff) => {
            check_shape(name, &weight, diff.dims())?;
            let diff = diff.to_device(&device)?.to_dtype(dtype)?;
            Ok(weight.add(&diff.affine(strength, 0.0)?)?)
        }
        Delta::LowRank { up, down, alpha } => {
            if up.rank() < 2 || down.rank() < 2 {
                return Err(crate::QuantPatchError::PatchApplication {
                    name: name.to_string(),
                    reason: format!(
                        "Low-rank factors must be at least 2-D: up {:?}, down {:?}",
                        up.dims(),
                        down.dims()
                    ),
                });
            }
            // Conv adapters carry trailing kernel dims; fold them into the matmul
            let up = up.to_device(&device)?.to_dtype(dtype)?.flatten_from(1)?;
            let down = down.to_device(&device)?.to_dtype(dtype)?.flatten_from(1)?;
            let rank = down.dims()[0];
            if up.dims()[1] != rank {
                return Err(crate::QuantPatchError::PatchApplication {
                    name: name.to_string(),
                    reason: format!(
                        "Low-rank factors disagree on rank: up {:?}, down {:?}",
                        up.dims(),
                        down.dims()
                    ),
                });
            }

            let product = up.matmul(&down)?;
            if product.elem_count() != weight.elem_count() {
                return Err(crate::QuantPatchError::IncompatibleShape {
                    name: name.to_string(),
                    expected: weight.dims().to_vec(),
                    actual: product.dims().to_vec(),
                });
            }

            let scale = alpha.map_or(1.0, |a| a / rank as f64) * strength;
            let update = product.reshape(weight.shape())?.affine(scale, 0.0)?;
            Ok(weight.add(&update)?)
        }
        Delta::Set(value) => {
            check_shape(name, &weight, value.dims())?;
            Ok(value.to_device(&device)?.to_dtype(dtype)?)
        }
    }
}

fn check_shape(name: &str, weight: &Tensor, actual: &[usize]) -> crate::Result<()> {
    if weight.dims() != actual {
        return Err(crate::QuantPatchError::IncompatibleShape {
            name: name.to_string(),
            expected: weight.dims().to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}
