//! Preview decoders
//!
//! Two kinds are supported: a linear latent-to-RGB projection (no weights
//! beyond a 16x3 matrix) and an opaque fast video decoder such as TAEHV,
//! which may also upsample in time.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::PreviewError;

/// Decodes a slice of latent frames to preview images
pub trait PreviewDecoder<B: Backend>: Send + Sync {
    /// `[1, C, T, h, w]` latent frames to `[F, H, W, 3]` images in [0, 1]
    fn decode(&self, latents: Tensor<B, 5>) -> Result<Tensor<B, 4>, PreviewError>;

    /// Pixel frames produced per latent frame
    fn temporal_upscale(&self) -> usize {
        1
    }
}

/// Length of the preview sequence the frame index wraps over
///
/// A latent of `len` frames previews as `len` images under a per-frame
/// decoder, and as `(len - 1) * upscale + 1` under a causal temporal
/// decoder (the first latent frame expands to one image).
pub fn preview_length(latent_frames: usize, temporal_upscale: usize) -> usize {
    if temporal_upscale <= 1 || latent_frames == 0 {
        latent_frames.max(1)
    } else {
        (latent_frames - 1) * temporal_upscale + 1
    }
}

/// Wan 2.1 latent-to-RGB projection
const WAN21_RGB_FACTORS: [[f32; 3]; 16] = [
    [-0.1299, -0.1692, 0.2932],
    [0.0671, 0.0406, 0.0442],
    [0.3568, 0.2548, 0.1747],
    [0.0372, 0.2344, 0.1420],
    [0.0313, 0.0189, -0.0328],
    [0.0296, -0.0956, -0.0665],
    [-0.3477, -0.4059, -0.2925],
    [0.0166, 0.1902, 0.1975],
    [-0.0412, 0.0267, -0.1364],
    [-0.1293, 0.0740, 0.1636],
    [0.0680, 0.3019, 0.1128],
    [0.0032, 0.0581, 0.0639],
    [-0.1251, 0.0927, 0.1699],
    [0.0060, -0.0633, 0.0005],
    [0.3477, 0.2275, 0.2950],
    [0.1984, 0.0913, 0.1861],
];

const WAN21_RGB_BIAS: [f32; 3] = [-0.1835, -0.0868, -0.3360];

/// Linear projection of latent channels to RGB
#[derive(Debug, Clone)]
pub struct LatentRgb<B: Backend> {
    /// `[C, 3]`
    factors: Tensor<B, 2>,
    /// `[3]`
    bias: Tensor<B, 1>,
}

impl<B: Backend> LatentRgb<B> {
    pub fn new(factors: Tensor<B, 2>, bias: Tensor<B, 1>) -> Self {
        Self { factors, bias }
    }

    /// Projection for the Wan 2.1 latent space
    pub fn wan21(device: &B::Device) -> Self {
        let factors: Vec<f32> = WAN21_RGB_FACTORS.iter().flatten().copied().collect();
        Self {
            factors: Tensor::from_data(TensorData::new(factors, [16, 3]), device),
            bias: Tensor::from_data(TensorData::new(WAN21_RGB_BIAS.to_vec(), [3]), device),
        }
    }

    pub fn channels(&self) -> usize {
        self.factors.dims()[0]
    }
}

impl<B: Backend> PreviewDecoder<B> for LatentRgb<B> {
    fn decode(&self, latents: Tensor<B, 5>) -> Result<Tensor<B, 4>, PreviewError> {
        let [batch, channels, t, h, w] = latents.dims();
        if channels != self.channels() {
            return Err(PreviewError::Decode(format!(
                "expected {} latent channels, got {}",
                self.channels(),
                channels
            )));
        }
        // Batch-major frames: [B*T, h, w, C]
        let pixels = latents.permute([0, 2, 3, 4, 1]).reshape([batch * t * h * w, channels]);
        let rgb = pixels.matmul(self.factors.clone()) + self.bias.clone().unsqueeze::<2>();
        let rgb = (rgb + 1.0) / 2.0;
        Ok(rgb.reshape([batch * t, h, w, 3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_preview_length() {
        assert_eq!(preview_length(13, 1), 13);
        assert_eq!(preview_length(13, 4), 49);
        assert_eq!(preview_length(1, 4), 1);
    }

    #[test]
    fn test_wan21_projection_shape() {
        let device = Default::default();
        let decoder = LatentRgb::<TestBackend>::wan21(&device);
        let latents = Tensor::<TestBackend, 5>::zeros([1, 16, 3, 4, 6], &device);
        let images = decoder.decode(latents).unwrap();
        assert_eq!(images.dims(), [3, 4, 6, 3]);
    }

    #[test]
    fn test_zero_latent_maps_to_bias() {
        let device = Default::default();
        let decoder = LatentRgb::<TestBackend>::wan21(&device);
        let latents = Tensor::<TestBackend, 5>::zeros([1, 16, 1, 1, 1], &device);
        let rgb = decoder.decode(latents).unwrap().into_data().to_vec::<f32>().unwrap();
        for (value, bias) in rgb.iter().zip(WAN21_RGB_BIAS.iter()) {
            assert!((value - (bias + 1.0) / 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_channel_mismatch() {
        let device = Default::default();
        let decoder = LatentRgb::<TestBackend>::wan21(&device);
        let latents = Tensor::<TestBackend, 5>::zeros([1, 4, 1, 2, 2], &device);
        assert!(matches!(decoder.decode(latents), Err(PreviewError::Decode(_))));
    }
}
