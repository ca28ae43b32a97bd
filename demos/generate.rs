//! Example: Generate a short clip with stand-in models
//!
//! Runs the full sampling pipeline, preview stream and post-processing with
//! toy collaborators in place of the Wan 2.1 networks, which is enough to
//! watch the scheduler, guidance patches and previews at work.
//!
//! # Usage
//!
//! ```bash
//! # Build with CPU backend
//! RUST_LOG=info cargo run --example generate --features cpu --release
//!
//! # Build with Metal backend (macOS)
//! cargo run --example generate --features metal --release
//! ```

use std::sync::Arc;

use burn::prelude::*;
use crossbeam::channel::unbounded;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wanflow_burn::imageops;
use wanflow_burn::modules::memory::Unbounded;
use wanflow_burn::postprocess::EnhancedVideo;
use wanflow_burn::preview::{LatentRgb, PreviewDecoder};
use wanflow_burn::{
    Conditioning, DiffusionModel, EnhanceSettings, Enhancer, FrameInterpolator, GenerateRequest, MemoryConfig,
    PreviewEvent, ResidentModels, ResourceGuard, SampleError, SamplerSettings, TextEncoder, TransformerOptions,
    VaeDecodeMode, VideoConfig, VideoPipeline, VideoVae,
};

// Backend and device type selection based on features
#[cfg(feature = "metal")]
mod backend {
    pub type Backend = burn::backend::candle::Candle;
    pub type Device = burn::backend::candle::CandleDevice;

    pub fn get_device() -> Device {
        Device::metal(0)
    }
}

#[cfg(all(feature = "cuda", not(feature = "metal")))]
mod backend {
    pub type Backend = burn::backend::candle::Candle;
    pub type Device = burn::backend::candle::CandleDevice;

    pub fn get_device() -> Device {
        Device::cuda(0)
    }
}

#[cfg(all(feature = "cpu", not(feature = "metal"), not(feature = "cuda")))]
mod backend {
    pub type Backend = burn::backend::ndarray::NdArray<f32>;
    pub type Device = burn::backend::ndarray::NdArrayDevice;

    pub fn get_device() -> Device {
        Device::Cpu
    }
}

use backend::{get_device, Backend as DemoBackend};

/// Velocity field pulling every latent towards the prompt embedding mean
struct ToyModel;

impl<B: Backend> DiffusionModel<B> for ToyModel {
    fn name(&self) -> &str {
        "wan2.1_t2v_1.3B_toy"
    }

    fn forward(
        &self,
        x: Tensor<B, 5>,
        _timestep: f32,
        cond: &Conditioning<B>,
        options: &TransformerOptions,
    ) -> Result<Tensor<B, 5>, SampleError> {
        let target = cond.embedding().clone().mean().reshape([1, 1, 1, 1, 1]);
        let damping = 1.0 + options.skip_layers.len() as f32 * 0.1;
        Ok((x - target) * damping)
    }
}

/// Hashes the prompt into a constant embedding
struct ToyTextEncoder<B: Backend> {
    device: B::Device,
}

impl<B: Backend> TextEncoder<B> for ToyTextEncoder<B> {
    fn encode(&self, text: &str) -> Result<Tensor<B, 3>, SampleError> {
        let value = text.bytes().map(|b| b as f32).sum::<f32>() % 97.0 / 97.0 - 0.5;
        Ok(Tensor::full([1, 8, 32], value, &self.device))
    }
}

/// Linear latent projection upsampled to pixel size
struct ToyVae<B: Backend> {
    rgb: LatentRgb<B>,
}

impl<B: Backend> VideoVae<B> for ToyVae<B> {
    fn encode(&self, frames: Tensor<B, 4>) -> Result<Tensor<B, 5>, SampleError> {
        let [f, h, w, _] = frames.dims();
        Ok(Tensor::zeros([1, 16, (f - 1) / 4 + 1, h / 8, w / 8], &frames.device()))
    }

    fn decode(&self, latent: Tensor<B, 5>) -> Result<Tensor<B, 4>, SampleError> {
        let [_, _, _, h, w] = latent.dims();
        let frames = self
            .rgb
            .decode(latent)
            .map_err(|e| SampleError::Model(e.to_string()))?;
        Ok(imageops::resize(frames, w * 8, h * 8))
    }

    fn decode_tiled(&self, latent: Tensor<B, 5>, _tile_size: usize) -> Result<Tensor<B, 4>, SampleError> {
        self.decode(latent)
    }
}

/// Linear blend between neighbouring frames
struct BlendInterpolator;

impl<B: Backend> FrameInterpolator<B> for BlendInterpolator {
    fn interpolate(&self, first: Tensor<B, 4>, second: Tensor<B, 4>, timestep: f32) -> Result<Tensor<B, 4>, SampleError> {
        Ok(first * (1.0 - timestep) + second * timestep)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let device = get_device();
    info!("Using device: {:?}", device);

    let memory = MemoryConfig::low_memory();
    let resident = Arc::new(ResidentModels::new());
    let mut pipeline = VideoPipeline::<DemoBackend>::builder(device.clone())
        .with_model(Arc::new(ToyModel))
        .with_text_encoder(Arc::new(ToyTextEncoder { device: device.clone() }))
        .with_vae(Arc::new(ToyVae {
            rgb: LatentRgb::wan21(&device),
        }))
        .with_preview_decoder(Arc::new(LatentRgb::wan21(&device)))
        .with_resident(resident.clone())
        .build()?;

    let config = VideoConfig::preview()
        .with_positive("Ocean waves crashing on a beach at sunset".into())
        .with_negative("blurry, static".into())
        .with_skip_layer("9".into())
        .with_cfg_zero_steps(1);
    let estimate = pipeline.estimate_memory(&config);
    info!(
        "Generating {}x{}, {} frames, {} tokens (~{:.2} GB)",
        config.width,
        config.height,
        config.frames(),
        estimate.num_tokens,
        estimate.total_gb()
    );

    let decode = if memory.vae_tiling {
        VaeDecodeMode::Tiled
    } else {
        VaeDecodeMode::Default
    };
    let settings = SamplerSettings::new()
        .with_seed(42)
        .with_vae_decode_type(decode)
        .with_vae_tile_size(memory.vae_tile_size)
        .with_denoised_output(true);

    let (tx, rx) = unbounded();
    let output = pipeline.generate(GenerateRequest::new(config, settings).with_preview(Box::new(tx)))?;
    for event in rx.try_iter() {
        match event {
            PreviewEvent::Start { length, rate } => info!("Preview stream: {} frames at {} fps", length, rate),
            PreviewEvent::Image(bytes) => info!("Preview frame: {} bytes", bytes.len()),
        }
    }
    if let Some(counts) = output.preview {
        info!("Previews sent {}, dropped {}", counts.sent, counts.dropped);
    }

    let enhancer = Enhancer::new(ResourceGuard::new(&Unbounded, &memory), resident.as_ref())
        .with_interpolator(Arc::new(BlendInterpolator))
        .with_initial_tile(memory.upscale_tile);
    let EnhancedVideo { images, framerate } = enhancer.process(output.images, &EnhanceSettings::new())?;
    info!("Final clip: {:?} at {} fps", images.dims(), framerate);

    Ok(())
}
