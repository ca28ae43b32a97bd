//! Post-processing of decoded frames: upscaling and frame interpolation
//!
//! Both models are opaque. The upscaler runs in overlapping tiles whose
//! outputs are feather-blended; the tile size halves on out-of-memory down
//! to [`MIN_TILE`]. Before the upscaler runs the resource guard is asked
//! for its working set so idle resident models can be evicted first.

use std::sync::Arc;

use burn::config::Config;
use burn::prelude::*;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SampleError;
use crate::imageops;
use crate::modules::memory::{retry_tiled, upscale_working_set, Evict, ResourceGuard, MIN_TILE};

/// Pixels shared by neighbouring upscale tiles
pub const TILE_OVERLAP: usize = 32;

/// Frame rate of sampled clips
pub const BASE_FRAME_RATE: usize = 16;

/// Single-image super-resolution model
pub trait Upscaler<B: Backend>: Send + Sync {
    /// Fixed upscale factor of the network
    fn scale(&self) -> f32;

    fn size_bytes(&self) -> u64 {
        0
    }

    /// `[N, h, w, 3]` to `[N, h * scale, w * scale, 3]`
    fn upscale(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>, SampleError>;
}

/// Pairwise frame interpolation model
pub trait FrameInterpolator<B: Backend>: Send + Sync {
    /// Frame at `timestep` in (0, 1) between `first` and `second` (`[1, H, W, 3]`)
    fn interpolate(&self, first: Tensor<B, 4>, second: Tensor<B, 4>, timestep: f32) -> Result<Tensor<B, 4>, SampleError>;
}

/// Which post-process runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOrder {
    #[default]
    UpscaleFirst,
    InterpolateFirst,
}

/// Enhancement settings
#[derive(Config, Debug)]
pub struct EnhanceSettings {
    /// Final size relative to the input
    #[config(default = 1.0)]
    pub upscale_factor: f32,

    /// Target frame rate of interpolation (30 or 60)
    #[config(default = 30)]
    pub interpolate_frame: usize,

    #[config(default = "ProcessOrder::UpscaleFirst")]
    pub order: ProcessOrder,
}

impl EnhanceSettings {
    /// Frames generated per input frame pair
    pub fn multiplier(&self) -> usize {
        (self.interpolate_frame / 15).max(1)
    }
}

/// Enhanced frames and their playback rate
#[derive(Debug, Clone)]
pub struct EnhancedVideo<B: Backend> {
    pub images: Tensor<B, 4>,
    pub framerate: usize,
}

/// Runs the optional upscale and interpolation stages
pub struct Enhancer<'a, B: Backend> {
    upscaler: Option<Arc<dyn Upscaler<B>>>,
    interpolator: Option<Arc<dyn FrameInterpolator<B>>>,
    guard: ResourceGuard<'a>,
    evict: &'a dyn Evict,
    initial_tile: usize,
}

impl<'a, B: Backend> Enhancer<'a, B> {
    pub fn new(guard: ResourceGuard<'a>, evict: &'a dyn Evict) -> Self {
        Self {
            upscaler: None,
            interpolator: None,
            guard,
            evict,
            initial_tile: 512,
        }
    }

    pub fn with_upscaler(mut self, upscaler: Arc<dyn Upscaler<B>>) -> Self {
        self.upscaler = Some(upscaler);
        self
    }

    pub fn with_interpolator(mut self, interpolator: Arc<dyn FrameInterpolator<B>>) -> Self {
        self.interpolator = Some(interpolator);
        self
    }

    pub fn with_initial_tile(mut self, tile: usize) -> Self {
        self.initial_tile = tile.max(MIN_TILE);
        self
    }

    pub fn process(&self, images: Tensor<B, 4>, settings: &EnhanceSettings) -> Result<EnhancedVideo<B>, SampleError> {
        let images = match settings.order {
            ProcessOrder::UpscaleFirst => {
                let images = self.upscale(images, settings.upscale_factor)?;
                self.interpolate(images, settings.multiplier())?
            }
            ProcessOrder::InterpolateFirst => {
                let images = self.interpolate(images, settings.multiplier())?;
                self.upscale(images, settings.upscale_factor)?
            }
        };
        let framerate = if self.interpolator.is_some() {
            settings.interpolate_frame
        } else {
            BASE_FRAME_RATE
        };
        Ok(EnhancedVideo { images, framerate })
    }

    /// Tiled upscale, then resize by `factor / scale`
    pub fn upscale(&self, images: Tensor<B, 4>, factor: f32) -> Result<Tensor<B, 4>, SampleError> {
        let Some(upscaler) = &self.upscaler else {
            debug!("No upscale model, skipping upscale");
            return Ok(images);
        };
        let scale = upscaler.scale();
        let elem_bytes = std::mem::size_of::<B::FloatElem>();
        let input_bytes = (images.shape().num_elements() * elem_bytes) as u64;
        let estimate = upscale_working_set(upscaler.size_bytes(), self.initial_tile, elem_bytes, scale, input_bytes);
        self.guard.ensure_capacity(estimate, self.evict)?;

        info!("Upscaling {} frames x{}", images.dims()[0], scale);
        let upscaled = retry_tiled(self.initial_tile, MIN_TILE, |tile| {
            tiled_scale(images.clone(), tile, TILE_OVERLAP, scale, |patch| upscaler.upscale(patch))
        })?;
        let upscaled = upscaled.clamp(0.0, 1.0);

        let scale_by = factor / scale;
        let [_, h, w, _] = upscaled.dims();
        let width = (w as f32 * scale_by).round() as usize;
        let height = (h as f32 * scale_by).round() as usize;
        Ok(imageops::resize(upscaled, width.max(1), height.max(1)))
    }

    /// Insert `multiplier - 1` frames between each consecutive pair
    pub fn interpolate(&self, images: Tensor<B, 4>, multiplier: usize) -> Result<Tensor<B, 4>, SampleError> {
        let Some(interpolator) = &self.interpolator else {
            debug!("No interpolation model, skipping interpolation");
            return Ok(images);
        };
        let [n, h, w, c] = images.dims();
        if n < 2 || multiplier < 2 {
            return Ok(images);
        }

        info!("Interpolating {} frames x{}", n, multiplier);
        let frame = |i: usize| images.clone().slice([i..i + 1, 0..h, 0..w, 0..c]);
        let mut frames = Vec::with_capacity((n - 1) * multiplier + 1);
        for i in 0..n - 1 {
            let first = frame(i);
            let second = frame(i + 1);
            frames.push(first.clone());
            for k in 1..multiplier {
                let timestep = k as f32 / multiplier as f32;
                frames.push(interpolator.interpolate(first.clone(), second.clone(), timestep)?);
            }
        }
        frames.push(frame(n - 1));
        Ok(Tensor::cat(frames, 0))
    }
}

/// Tile start offsets covering `len` with tiles of `tile` sharing `overlap`
fn tile_starts(len: usize, tile: usize, overlap: usize) -> Vec<usize> {
    if len <= tile {
        return vec![0];
    }
    let stride = tile.saturating_sub(overlap).max(1);
    let mut starts = Vec::new();
    let mut position = 0;
    loop {
        if position + tile >= len {
            starts.push(len - tile);
            return starts;
        }
        starts.push(position);
        position += stride;
    }
}

fn ramp(i: usize, len: usize, feather: usize) -> f32 {
    if feather == 0 {
        return 1.0;
    }
    let mut value = 1.0;
    if i < feather {
        value *= (i + 1) as f32 / feather as f32;
    }
    let from_end = len - 1 - i;
    if from_end < feather {
        value *= (from_end + 1) as f32 / feather as f32;
    }
    value
}

/// Blend weights `[1, h, w, 1]` fading towards every edge
fn feather_mask<B: Backend>(h: usize, w: usize, feather: usize, device: &B::Device) -> Tensor<B, 4> {
    let mut values = Vec::with_capacity(h * w);
    for y in 0..h {
        let row = ramp(y, h, feather);
        for x in 0..w {
            values.push(row * ramp(x, w, feather));
        }
    }
    Tensor::from_data(TensorData::new(values, [1, h, w, 1]), device)
}

/// Apply `f` over overlapping tiles of each frame and blend the results
pub fn tiled_scale<B, F>(images: Tensor<B, 4>, tile: usize, overlap: usize, scale: f32, mut f: F) -> Result<Tensor<B, 4>, SampleError>
where
    B: Backend,
    F: FnMut(Tensor<B, 4>) -> Result<Tensor<B, 4>, SampleError>,
{
    let [n, h, w, c] = images.dims();
    let device = images.device();
    let out_h = (h as f32 * scale).round() as usize;
    let out_w = (w as f32 * scale).round() as usize;
    let (th, tw) = (tile.min(h), tile.min(w));
    let rows = tile_starts(h, tile, overlap);
    let cols = tile_starts(w, tile, overlap);
    let feather = (overlap as f32 * scale).round() as usize;

    let mut frames = Vec::with_capacity(n);
    for i in 0..n {
        let image = images.clone().slice([i..i + 1, 0..h, 0..w, 0..c]);
        let mut out = Tensor::<B, 4>::zeros([1, out_h, out_w, c], &device);
        let mut weight = Tensor::<B, 4>::zeros([1, out_h, out_w, 1], &device);

        for &y in &rows {
            for &x in &cols {
                let patch = image.clone().slice([0..1, y..y + th, x..x + tw, 0..c]);
                let scaled = f(patch)?;
                let [_, sh, sw, _] = scaled.dims();
                let oy = ((y as f32 * scale).round() as usize).min(out_h);
                let ox = ((x as f32 * scale).round() as usize).min(out_w);
                let sh = sh.min(out_h - oy);
                let sw = sw.min(out_w - ox);
                if sh == 0 || sw == 0 {
                    continue;
                }
                let scaled = scaled.slice([0..1, 0..sh, 0..sw, 0..c]);
                let mask = feather_mask::<B>(sh, sw, feather, &device);

                let region = [0..1, oy..oy + sh, ox..ox + sw, 0..c];
                let blended = out.clone().slice(region.clone()) + scaled * mask.clone();
                out = out.slice_assign(region, blended);

                let region = [0..1, oy..oy + sh, ox..ox + sw, 0..1];
                let total = weight.clone().slice(region.clone()) + mask;
                weight = weight.slice_assign(region, total);
            }
        }
        frames.push(out / weight.clamp_min(1e-6));
    }
    Ok(Tensor::cat(frames, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;
    use crate::modules::memory::{DeviceMemory, MemoryConfig, Unbounded};
    use burn::backend::NdArray;
    use parking_lot::Mutex;

    type TestBackend = NdArray<f32>;

    struct NothingToEvict;

    impl Evict for NothingToEvict {
        fn evict_one(&self) -> Option<u64> {
            None
        }
    }

    /// Nearest-neighbour x2 that runs out of memory above `max_input` pixels a side
    struct Doubling {
        max_input: usize,
        seen: Mutex<Vec<usize>>,
    }

    impl Upscaler<TestBackend> for Doubling {
        fn scale(&self) -> f32 {
            2.0
        }

        fn upscale(&self, images: Tensor<TestBackend, 4>) -> Result<Tensor<TestBackend, 4>, SampleError> {
            let [n, h, w, c] = images.dims();
            self.seen.lock().push(h.max(w));
            if h.max(w) > self.max_input {
                return Err(ResourceError::OutOfMemory { tile: h.max(w) }.into());
            }
            let rows = images.reshape([n, h, 1, w, c]).repeat_dim(2, 2).reshape([n, h * 2, w, c]);
            Ok(rows.reshape([n, h * 2, w, 1, c]).repeat_dim(3, 2).reshape([n, h * 2, w * 2, c]))
        }
    }

    struct Midpoint;

    impl FrameInterpolator<TestBackend> for Midpoint {
        fn interpolate(
            &self,
            first: Tensor<TestBackend, 4>,
            second: Tensor<TestBackend, 4>,
            timestep: f32,
        ) -> Result<Tensor<TestBackend, 4>, SampleError> {
            Ok(first * (1.0 - timestep) + second * timestep)
        }
    }

    fn constant(n: usize, h: usize, w: usize, value: f32) -> Tensor<TestBackend, 4> {
        Tensor::full([n, h, w, 3], value, &Default::default())
    }

    #[test]
    fn test_tile_starts_cover_length() {
        assert_eq!(tile_starts(100, 512, 32), vec![0]);
        assert_eq!(tile_starts(300, 128, 32), vec![0, 96, 172]);
    }

    #[test]
    fn test_tiled_identity_preserves_image() {
        let device = Default::default();
        let values: Vec<f32> = (0..40 * 50 * 3).map(|i| (i % 97) as f32 / 97.0).collect();
        let image = Tensor::<TestBackend, 4>::from_data(TensorData::new(values, [1, 40, 50, 3]), &device);
        let out = tiled_scale(image.clone(), 16, 4, 1.0, Ok).unwrap();
        let out = out.into_data().to_vec::<f32>().unwrap();
        let expected = image.into_data().to_vec::<f32>().unwrap();
        assert_eq!(out.len(), expected.len());
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_upscale_retries_with_smaller_tiles() {
        let memory = Unbounded;
        let config = MemoryConfig::default();
        let upscaler = Arc::new(Doubling {
            max_input: 256,
            seen: Mutex::new(Vec::new()),
        });
        let enhancer = Enhancer::new(ResourceGuard::new(&memory, &config), &NothingToEvict).with_upscaler(upscaler.clone());

        let out = enhancer.upscale(constant(1, 300, 300, 0.25), 2.0).unwrap();
        assert_eq!(out.dims(), [1, 600, 600, 3]);
        let seen = upscaler.seen.lock().clone();
        assert_eq!(seen[0], 300);
        assert!(seen[1..].iter().all(|&side| side == 256));
    }

    #[test]
    fn test_upscale_factor_resizes_output() {
        let memory = Unbounded;
        let config = MemoryConfig::default();
        let upscaler = Arc::new(Doubling {
            max_input: 1024,
            seen: Mutex::new(Vec::new()),
        });
        let enhancer = Enhancer::new(ResourceGuard::new(&memory, &config), &NothingToEvict).with_upscaler(upscaler);
        // Model scale 2, requested 1.5: output is 1.5x the input
        let out = enhancer.upscale(constant(2, 32, 64, 0.5), 1.5).unwrap();
        assert_eq!(out.dims(), [2, 48, 96, 3]);
    }

    #[test]
    fn test_upscale_fails_without_headroom() {
        struct Full;
        impl DeviceMemory for Full {
            fn free_bytes(&self) -> u64 {
                0
            }
            fn total_bytes(&self) -> u64 {
                1 << 30
            }
        }
        let memory = Full;
        let config = MemoryConfig::default();
        let upscaler = Arc::new(Doubling {
            max_input: 1024,
            seen: Mutex::new(Vec::new()),
        });
        let enhancer = Enhancer::new(ResourceGuard::new(&memory, &config), &NothingToEvict).with_upscaler(upscaler.clone());
        let result = enhancer.upscale(constant(1, 8, 8, 0.5), 2.0);
        assert!(matches!(
            result,
            Err(SampleError::Resource(ResourceError::InsufficientMemory { .. }))
        ));
        assert!(upscaler.seen.lock().is_empty());
    }

    #[test]
    fn test_headroom_estimate_follows_initial_tile() {
        struct Fixed(u64);
        impl DeviceMemory for Fixed {
            fn free_bytes(&self) -> u64 {
                self.0
            }
            fn total_bytes(&self) -> u64 {
                self.0
            }
        }
        let input_bytes = (8 * 8 * 3 * std::mem::size_of::<f32>()) as u64;
        let memory = Fixed(upscale_working_set(0, 256, std::mem::size_of::<f32>(), 2.0, input_bytes));
        let config = MemoryConfig::default();
        let upscaler = Arc::new(Doubling {
            max_input: 1024,
            seen: Mutex::new(Vec::new()),
        });

        let small = Enhancer::new(ResourceGuard::new(&memory, &config), &NothingToEvict)
            .with_upscaler(upscaler.clone())
            .with_initial_tile(256);
        assert_eq!(small.upscale(constant(1, 8, 8, 0.5), 2.0).unwrap().dims(), [1, 16, 16, 3]);

        let large = Enhancer::new(ResourceGuard::new(&memory, &config), &NothingToEvict).with_upscaler(upscaler);
        assert!(matches!(
            large.upscale(constant(1, 8, 8, 0.5), 2.0),
            Err(SampleError::Resource(ResourceError::InsufficientMemory { .. }))
        ));
    }

    #[test]
    fn test_interpolation_multiplier() {
        let memory = Unbounded;
        let config = MemoryConfig::default();
        let enhancer = Enhancer::<TestBackend>::new(ResourceGuard::new(&memory, &config), &NothingToEvict)
            .with_interpolator(Arc::new(Midpoint));

        let device = Default::default();
        let frames = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0], [3, 1, 1, 3]),
            &device,
        );
        let settings = EnhanceSettings::new().with_interpolate_frame(60);
        let video = enhancer.process(frames, &settings).unwrap();

        assert_eq!(video.framerate, 60);
        assert_eq!(video.images.dims(), [9, 1, 1, 3]);
        let red: Vec<f32> = video.images.into_data().to_vec::<f32>().unwrap().into_iter().step_by(3).collect();
        assert_eq!(red, vec![0.0, 0.25, 0.5, 0.75, 1.0, 0.75, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn test_disabled_stages_keep_frames_and_base_rate() {
        let memory = Unbounded;
        let config = MemoryConfig::default();
        let enhancer = Enhancer::<TestBackend>::new(ResourceGuard::new(&memory, &config), &NothingToEvict);
        let video = enhancer
            .process(constant(5, 4, 4, 0.5), &EnhanceSettings::new().with_order(ProcessOrder::InterpolateFirst))
            .unwrap();
        assert_eq!(video.framerate, BASE_FRAME_RATE);
        assert_eq!(video.images.dims(), [5, 4, 4, 3]);
    }
}
