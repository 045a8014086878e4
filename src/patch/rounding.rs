//! Stochastic rounding of merged weights back to their storage dtype.
//!
//! Rounding a patched weight to nearest every time it is re-materialized
//! biases it toward the base weight. Rounding up with probability equal to
//! the distance from the lower neighbour keeps the expected value exact.

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Rounds a tensor into a narrower storage dtype
pub trait StochasticRounder: Send + Sync {
    fn round(&self, tensor: &Tensor, dtype: DType) -> crate::Result<Tensor>;
}

/// Stochastic rounder with a fixed seed, so the same input always rounds
/// the same way
#[derive(Debug, Clone, Copy, Default)]
pub struct SeededRounder {
    seed: u64,
}

impl SeededRounder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl StochasticRounder for SeededRounder {
    fn round(&self, tensor: &Tensor, dtype: DType) -> crate::Result<Tensor> {
        if tensor.dtype() == dtype {
            return Ok(tensor.clone());
        }
        if !matches!(dtype, DType::F16 | DType::BF16) {
            return tensor.to_dtype(dtype).map_err(Into::into);
        }

        let device = tensor.device().clone();
        let shape = tensor.dims().to_vec();
        let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let rounded = if dtype == DType::BF16 {
            let out: Vec<bf16> = values
                .iter()
                .map(|v| round_bf16(*v, rng.random::<u16>()))
                .collect();
            Tensor::from_vec(out, shape, &Device::Cpu)?
        } else {
            let out: Vec<f16> = values
                .iter()
                .map(|v| round_f16(*v, rng.random::<f32>()))
                .collect();
            Tensor::from_vec(out, shape, &Device::Cpu)?
        };

        rounded.to_device(&device).map_err(Into::into)
    }
}

/// bf16 is the upper half of an f32: add noise below the cut, then truncate
fn round_bf16(value: f32, noise: u16) -> bf16 {
    if !value.is_finite() {
        return bf16::from_f32(value);
    }
    let bits = value.to_bits().wrapping_add(noise as u32);
    let rounded = bf16::from_bits((bits >> 16) as u16);
    if rounded.is_finite() {
        rounded
    } else {
        bf16::from_f32(value)
    }
}

/// Pick one of the two f16 neighbours of `value`, rounding up with
/// probability proportional to its distance from the lower one
fn round_f16(value: f32, draw: f32) -> f16 {
    let nearest = f16::from_f32(value);
    if !value.is_finite() || !nearest.is_finite() || nearest.to_f32() == value {
        return nearest;
    }

    let (lower, upper) = if nearest.to_f32() < value {
        (nearest, f16_next_up(nearest))
    } else {
        (f16_next_down(nearest), nearest)
    };
    if !lower.is_finite() || !upper.is_finite() {
        return nearest;
    }

    let lo = lower.to_f32();
    let hi = upper.to_f32();
    let p_up = (value - lo) / (hi - lo);
    if draw < p_up {
        upper
    } else {
        lower
    }
}

fn f16_next_up(v: f16) -> f16 {
    let bits = v.to_bits();
    match bits {
        0x0000 | 0x8000 => f16::from_bits(0x0001),
        b if b & 0x8000 == 0 => f16::from_bits(b + 1),
        b => f16::from_bits(b - 1),
    }
}

fn f16_next_down(v: f16) -> f16 {
    let bits = v.to_bits();
    match bits {
        0x0000 | 0x8000 => f16::from_bits(0x8001),
        b if b & 0x8000 == 0 => f16::from_bits(b - 1),
        b => f16::from_bits(b + 1),
    }
}
