//! Interfaces of the networks the sampler drives
//!
//! The transformer, encoders and VAE are opaque: the sampler only relies on
//! their tensor-shape contracts.
//!
//! | Collaborator | Input | Output |
//! |--------------|-------|--------|
//! | [`DiffusionModel`] | latent `[B, 16, T, H/8, W/8]`, timestep | velocity, same shape |
//! | [`TextEncoder`] | prompt | embedding `[1, L, D]` |
//! | [`VisionEncoder`] | image `[N, H, W, 3]` | embedding `[1, L, D]` |
//! | [`VideoVae`] | frames `[F, H, W, 3]` | latent `[1, 16, (F-1)/4+1, H/8, W/8]` |

use std::path::PathBuf;

use burn::prelude::*;

use crate::conditioning::Conditioning;
use crate::error::{ModelLoadError, SampleError};
use crate::modules::enhance::EnhanceVideo;

/// Which conditioning a forward evaluation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Branch {
    #[default]
    Positive,
    Negative,
}

impl Branch {
    pub fn index(&self) -> usize {
        match self {
            Branch::Positive => 0,
            Branch::Negative => 1,
        }
    }
}

/// Per-evaluation options the patch chain passes into the transformer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformerOptions {
    /// Conditioning branch being evaluated
    pub branch: Branch,
    /// Current step index
    pub step: usize,
    /// Fraction of the schedule completed, in [0, 1]
    pub progress: f32,
    /// Blocks whose contribution must be suppressed for this evaluation
    pub skip_layers: Vec<usize>,
    /// Temporal attention enhancement, when enabled
    pub enhance: Option<EnhanceVideo>,
}

/// Settings handed to a model's compile hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileSettings {
    pub mode: String,
    pub backend: String,
    pub fullgraph: bool,
    pub dynamic: bool,
}

impl CompileSettings {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            backend: "inductor".into(),
            fullgraph: false,
            dynamic: false,
        }
    }
}

/// The denoising transformer
pub trait DiffusionModel<B: Backend>: Send + Sync {
    /// Model identity (checkpoint name)
    fn name(&self) -> &str;

    /// Predict the flow velocity for latent `x` at `timestep`
    fn forward(
        &self,
        x: Tensor<B, 5>,
        timestep: f32,
        cond: &Conditioning<B>,
        options: &TransformerOptions,
    ) -> Result<Tensor<B, 5>, SampleError>;

    /// Prepare an optimised execution path; called at most once per instance
    fn compile(&self, _settings: &CompileSettings) -> Result<(), SampleError> {
        Ok(())
    }

    /// Device bytes held by the parameters
    fn size_bytes(&self) -> u64 {
        0
    }
}

/// Prompt encoder
pub trait TextEncoder<B: Backend>: Send + Sync {
    fn encode(&self, text: &str) -> Result<Tensor<B, 3>, SampleError>;

    /// Move weights off the accelerator
    fn offload(&self) {}
}

/// Image embedding encoder
pub trait VisionEncoder<B: Backend>: Send + Sync {
    fn encode(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 3>, SampleError>;

    fn offload(&self) {}
}

/// Video autoencoder
pub trait VideoVae<B: Backend>: Send + Sync {
    /// Encode pixel frames `[F, H, W, 3]` in [0, 1]
    fn encode(&self, frames: Tensor<B, 4>) -> Result<Tensor<B, 5>, SampleError>;

    /// Decode a latent to frames `[F, H, W, 3]`
    fn decode(&self, latent: Tensor<B, 5>) -> Result<Tensor<B, 4>, SampleError>;

    /// Decode spatial tiles of `tile_size` pixels to bound peak memory
    fn decode_tiled(&self, latent: Tensor<B, 5>, tile_size: usize) -> Result<Tensor<B, 4>, SampleError>;

    fn offload(&self) {}
}

/// Resolves weight names to local files, possibly downloading them
pub trait WeightStore: Send + Sync {
    fn resolve(&self, name: &str) -> Result<PathBuf, ModelLoadError>;
}
