//! Initial latent noise
//!
//! Burn has no per-call seeded random tensors, so seeded noise is drawn on
//! the host with a `StdRng` and uploaded. The same seed always yields the
//! same tensor regardless of backend.

use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Source of the initial latent perturbation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseSource {
    /// Standard normal noise from a seed
    Random { seed: u64 },
    /// All zeros (used when the input latent already carries noise)
    Empty,
}

impl NoiseSource {
    pub fn random(seed: u64) -> Self {
        NoiseSource::Random { seed }
    }

    /// Seed driving this source, if any
    pub fn seed(&self) -> Option<u64> {
        match self {
            NoiseSource::Random { seed } => Some(*seed),
            NoiseSource::Empty => None,
        }
    }

    /// Generate noise shaped like the latent
    pub fn generate<B: Backend>(&self, shape: [usize; 5], device: &B::Device) -> Tensor<B, 5> {
        match self {
            NoiseSource::Random { seed } => {
                let values = standard_normal(*seed, shape.iter().product());
                Tensor::from_data(TensorData::new(values, shape), device)
            }
            NoiseSource::Empty => Tensor::zeros(shape, device),
        }
    }
}

/// `len` standard normal samples from a seeded generator
pub fn standard_normal(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}
