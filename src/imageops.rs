//! Image batch helpers on channel-last frames `[N, H, W, C]`

use burn::config::Config;
use burn::prelude::*;
use burn::tensor::module::{conv2d, interpolate};
use burn::tensor::ops::{ConvOptions, InterpolateMode, InterpolateOptions};
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::noise::standard_normal;

/// Rec. 601 luma weights
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

/// Pixel value marking padding that guide noise leaves alone
const PADDING: f32 = -1.0;

/// Resize frames to `width` x `height` with bilinear filtering
pub fn resize<B: Backend>(frames: Tensor<B, 4>, width: usize, height: usize) -> Tensor<B, 4> {
    let [_, h, w, _] = frames.dims();
    if h == height && w == width {
        return frames;
    }
    let channels_first = frames.permute([0, 3, 1, 2]);
    let resized = interpolate(
        channels_first,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    );
    resized.permute([0, 2, 3, 1])
}

/// Crop the centre of each frame to the aspect ratio of `width` x `height`
pub fn center_crop<B: Backend>(frames: Tensor<B, 4>, width: usize, height: usize) -> Tensor<B, 4> {
    let [n, h, w, c] = frames.dims();
    let old_aspect = w as f32 / h as f32;
    let new_aspect = width as f32 / height as f32;

    if old_aspect > new_aspect {
        let x = ((w as f32 - w as f32 * (new_aspect / old_aspect)) / 2.0).round() as usize;
        frames.slice([0..n, 0..h, x..w - x, 0..c])
    } else if old_aspect < new_aspect {
        let y = ((h as f32 - h as f32 * (old_aspect / new_aspect)) / 2.0).round() as usize;
        frames.slice([0..n, y..h - y, 0..w, 0..c])
    } else {
        frames
    }
}

/// Centre-crop then resize, the way start images are fitted to the clip
pub fn fit_center<B: Backend>(frames: Tensor<B, 4>, width: usize, height: usize) -> Tensor<B, 4> {
    resize(center_crop(frames, width, height), width, height)
}

/// Output size when the longest side is limited to `resolution`
///
/// Returns `(width, height)`; frames already within the limit keep their size.
pub fn bounded_size(width: usize, height: usize, resolution: usize) -> (usize, usize) {
    if width <= resolution && height <= resolution {
        return (width, height);
    }
    if height < width {
        (resolution, ((resolution * height) / width).max(1))
    } else {
        (((resolution * width) / height).max(1), resolution)
    }
}

/// Downscale frames so neither side exceeds `resolution`, keeping aspect
pub fn limit_resolution<B: Backend>(frames: Tensor<B, 4>, resolution: usize) -> Tensor<B, 4> {
    let [_, h, w, _] = frames.dims();
    let (width, height) = bounded_size(w, h, resolution);
    resize(frames, width, height)
}

/// How a requested guide size follows the source aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepProportion {
    /// Use the requested size as is
    #[default]
    None,
    /// Keep the requested length on the source's shorter side
    Shortest,
    /// Keep the requested length on the source's longer side
    Longest,
}

/// Guide size for a `src_width` x `src_height` source
///
/// With a proportion mode the free side follows the source aspect and both
/// sides are rounded down to a multiple of 16.
pub fn proportional_size(
    src_width: usize,
    src_height: usize,
    width: usize,
    height: usize,
    keep: KeepProportion,
) -> (usize, usize) {
    let scaled = |side: usize, num: usize, den: usize| (side as f32 * num as f32 / den.max(1) as f32).round() as usize;
    let (width, height) = match keep {
        KeepProportion::None => return (width, height),
        KeepProportion::Longest if src_width > src_height => (width, scaled(width, src_height, src_width)),
        KeepProportion::Longest if src_width < src_height => (scaled(height, src_width, src_height), height),
        KeepProportion::Longest => (width.max(height), width.max(height)),
        KeepProportion::Shortest if src_width > src_height => (scaled(height, src_width, src_height), height),
        KeepProportion::Shortest if src_width < src_height => (width, scaled(width, src_height, src_width)),
        KeepProportion::Shortest => (width.min(height), width.min(height)),
    };
    let floor16 = |side: usize| (side - side % 16).max(16);
    (floor16(width), floor16(height))
}

/// Guide image preparation
#[derive(Config, Debug)]
pub struct GuideImageSettings {
    pub width: usize,
    pub height: usize,

    #[config(default = "KeepProportion::None")]
    pub keep_proportion: KeepProportion,

    /// Colour saturation, 1.0 leaves colours unchanged
    #[config(default = 1.0)]
    pub saturation: f32,

    /// Gaussian blur radius in pixels
    #[config(default = 0.0)]
    pub blur: f32,

    /// Standard deviation of the added Gaussian noise
    #[config(default = 0.015)]
    pub noise_strength: f32,

    #[config(default = 1234)]
    pub noise_seed: u64,
}

/// Separable Gaussian blur with standard deviation `radius`
///
/// Edge pixels average over the part of the kernel inside the frame.
pub fn gaussian_blur<B: Backend>(frames: Tensor<B, 4>, radius: f32) -> Tensor<B, 4> {
    let reach = (radius * 3.0).ceil() as usize;
    if radius <= 0.0 || reach == 0 {
        return frames;
    }
    let [_, h, w, c] = frames.dims();
    let device = frames.device();
    let taps: Vec<f32> = (0..=2 * reach)
        .map(|i| {
            let x = i as f32 - reach as f32;
            (-x * x / (2.0 * radius * radius)).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    let taps: Vec<f32> = taps.into_iter().map(|t| t / sum).collect();
    let len = taps.len();
    let kernel = Tensor::<B, 1>::from_data(TensorData::new(taps, [len]), &device);

    let pass = |x: Tensor<B, 4>, horizontal: bool| {
        let (shape, padding) = if horizontal {
            ([1, 1, 1, len], [0, reach])
        } else {
            ([1, 1, len, 1], [reach, 0])
        };
        let weight = kernel.clone().reshape(shape).repeat_dim(0, c);
        conv2d(x, weight, None, ConvOptions::new([1, 1], padding, [1, 1], c))
    };
    let blur = |x: Tensor<B, 4>| pass(pass(x, true), false);

    let channels_first = frames.permute([0, 3, 1, 2]);
    let coverage = blur(Tensor::ones([1, c, h, w], &device));
    let blurred = blur(channels_first) / coverage;
    blurred.permute([0, 2, 3, 1])
}

/// Fit a start or end image to the clip and roughen it with seeded noise
///
/// Frames are centre-fitted to the proportional size, resaturated, blurred,
/// noised (padding pixels excepted) and clamped to [0, 1].
pub fn prepare_guide_image<B: Backend>(frames: Tensor<B, 4>, settings: &GuideImageSettings) -> Tensor<B, 4> {
    let [_, h, w, _] = frames.dims();
    let (width, height) = proportional_size(w, h, settings.width, settings.height, settings.keep_proportion);
    let mut frames = fit_center(frames, width, height);
    let device = frames.device();

    if settings.saturation != 1.0 {
        let luma = Tensor::<B, 1>::from_floats(LUMA, &device).reshape([1, 1, 1, 3]);
        let gray = (frames.clone() * luma).sum_dim(3);
        frames = gray.clone() + (frames - gray) * settings.saturation;
    }
    frames = gaussian_blur(frames, settings.blur);

    if settings.noise_strength > 0.0 {
        let dims = frames.dims();
        let samples = standard_normal(settings.noise_seed, dims.iter().product());
        let noise = Tensor::<B, 4>::from_data(TensorData::new(samples, dims), &device) * settings.noise_strength;
        let padding = frames.clone().equal_elem(PADDING);
        frames = frames + noise.mask_fill(padding, 0.0);
    }

    frames.clamp(0.0, 1.0)
}

/// Quantise one `[H, W, 3]` frame in [0, 1] to packed RGB bytes
pub fn to_rgb8(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
        .collect()
}
