//! Reads patches from a safetensors delta file.
//!
//! Entries are grouped by the weight they target, using name suffixes:
//! - `<key>.diff`: added to the weight
//! - `<key>.lora_up.weight` + `<key>.lora_down.weight` (+ optional `<key>.alpha`)
//! - `<key>.set`: replaces the weight

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor};

use super::{Delta, Patch};

#[derive(Default)]
struct Entry {
    diff: Option<Tensor>,
    up: Option<Tensor>,
    down: Option<Tensor>,
    alpha: Option<Tensor>,
    set: Option<Tensor>,
}

/// Load every delta in `path` as a patch of `strength`, tensors on `device`.
///
/// For one weight, patches come out as diff, then low-rank, then set.
/// Unrecognized or half-specified entries are skipped with a warning.
pub fn load_deltas(
    path: impl AsRef<Path>,
    strength: f64,
    device: &Device,
) -> crate::Result<Vec<Patch>> {
    let path = path.as_ref();
    let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, device)?;

    let mut entries: BTreeMap<String, Entry> = BTreeMap::new();
    for (name, tensor) in tensors {
        let Some((key, slot)) = split_name(&name) else {
            tracing::warn!("Skipping unrecognized delta entry {}", name);
            continue;
        };
        let entry = entries.entry(key.to_string()).or_default();
        match slot {
            Slot::Diff => entry.diff = Some(tensor),
            Slot::Up => entry.up = Some(tensor),
            Slot::Down => entry.down = Some(tensor),
            Slot::Alpha => entry.alpha = Some(tensor),
            Slot::Set => entry.set = Some(tensor),
        }
    }

    let mut patches = Vec::new();
    for (key, entry) in entries {
        if let Some(diff) = entry.diff {
            patches.push(Patch::new(key.clone(), Delta::Diff(diff)).with_strength(strength));
        }

        match (entry.up, entry.down) {
            (Some(up), Some(down)) => {
                let alpha = match entry.alpha {
                    Some(alpha) => Some(scalar(&alpha)?),
                    None => None,
                };
                patches.push(
                    Patch::new(key.clone(), Delta::LowRank { up, down, alpha })
                        .with_strength(strength),
                );
            }
            (None, None) => {}
            _ => tracing::warn!("Skipping low-rank delta for {}: missing up or down factor", key),
        }

        if let Some(set) = entry.set {
            patches.push(Patch::new(key, Delta::Set(set)).with_strength(strength));
        }
    }

    tracing::info!("Loaded {} patches from {:?}", patches.len(), path);
    Ok(patches)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Diff,
    Up,
    Down,
    Alpha,
    Set,
}

fn split_name(name: &str) -> Option<(&str, Slot)> {
    const SUFFIXES: [(&str, Slot); 5] = [
        (".lora_up.weight", Slot::Up),
        (".lora_down.weight", Slot::Down),
        (".alpha", Slot::Alpha),
        (".diff", Slot::Diff),
        (".set", Slot::Set),
    ];

    SUFFIXES.iter().find_map(|(suffix, slot)| {
        name.strip_suffix(suffix)
            .filter(|key| !key.is_empty())
            .map(|key| (key, *slot))
    })
}

fn scalar(tensor: &Tensor) -> crate::Result<f64> {
    let values: Vec<f64> = tensor
        .to_dtype(candle_core::DType::F64)?
        .flatten_all()?
        .to_vec1()?;
    match values.as_slice() {
        [value] => Ok(*value),
        _ => Err(crate::QuantPatchError::PatchApplication {
            name: "alpha".to_string(),
            reason: format!("Expected a scalar alpha, got {} values", values.len()),
        }),
    }
}
