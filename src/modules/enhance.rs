//! Enhance-A-Video temporal attention weighting
//!
//! The model computes a cross-frame score from its temporal self-attention
//! and scales the attention output by it. The score grows with the mean
//! off-diagonal attention and the temporal length, so longer clips receive
//! proportionally stronger frame-to-frame coherence.

use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::TensorData;

/// Enhancement parameters injected into the transformer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhanceVideo {
    /// Enhancement strength; 0 leaves attention untouched
    pub weight: f32,
    /// Temporal length of the latent being sampled
    pub latent_frames: usize,
}

impl EnhanceVideo {
    pub fn new(weight: f32, latent_frames: usize) -> Self {
        Self { weight, latent_frames }
    }

    pub fn is_enabled(&self) -> bool {
        self.weight > 0.0
    }

    /// Scalar applied to the temporal attention output
    ///
    /// `query` and `key` are `[batch, heads, frames, head_dim]`. Returns 1.0
    /// when disabled so the multiplication is an exact identity.
    pub fn score<B: Backend>(&self, query: Tensor<B, 4>, key: Tensor<B, 4>) -> f32 {
        if !self.is_enabled() {
            return 1.0;
        }
        feta_score(query, key, self.latent_frames, self.weight)
    }
}

/// Enhance score for temporal attention: `mean_offdiag(attn) * (frames + weight)`,
/// never below 1
pub fn feta_score<B: Backend>(query: Tensor<B, 4>, key: Tensor<B, 4>, frames: usize, weight: f32) -> f32 {
    let [_, _, t, d] = query.dims();
    if t < 2 {
        return 1.0;
    }
    let device = query.device();
    let scale = (d as f32).powf(-0.5);

    let attn = softmax(query.matmul(key.swap_dims(2, 3)) * scale, 3);

    let mut off_diag = vec![1.0f32; t * t];
    for i in 0..t {
        off_diag[i * t + i] = 0.0;
    }
    let mask = Tensor::<B, 2>::from_data(TensorData::new(off_diag, [t, t]), &device).unsqueeze::<4>();

    let [b, h, _, _] = attn.dims();
    let total: f32 = (attn * mask).sum().into_scalar().elem();
    let mean = total / (b * h * t * (t - 1)) as f32;

    (mean * (frames as f32 + weight)).max(1.0)
}
