//! Wan 2.1 video generation pipeline
//!
//! Combines the patched diffusion model, text and vision encoders, the VAE
//! and the preview decoder for end-to-end generation:
//! 1. Encode prompts and offload the text encoder
//! 2. Build the empty latent and, for image-to-video, the guide latents
//! 3. Sample with classifier-free guidance while streaming previews
//! 4. Optionally refine the result with a short low-noise pass
//! 5. Decode with the selected VAE strategy

use std::sync::Arc;

use burn::prelude::*;
use tracing::{info, warn};

use crate::conditioning::{encode_guide_frames, Conditioning};
use crate::config::{PatchSettings, SamplerSettings, VaeDecodeMode, VideoConfig, LATENT_CHANNELS, SPATIAL_COMPRESSION};
use crate::control::GenerationControl;
use crate::error::{ConfigError, ModelLoadError, SampleError};
use crate::guider::{CfgGuider, NoObserver, SampleOutput, StepObserver};
use crate::imageops;
use crate::load::{LoadedModel, ModelLoader, ModelVariant};
use crate::model::{DiffusionModel, TextEncoder, VideoVae, VisionEncoder};
use crate::modules::memory::{retry_tiled, MIN_TILE};
use crate::modules::{CfgZeroStar, EnhanceVideo, SkipLayerGuidance};
use crate::noise::NoiseSource;
use crate::patch::{ModelPatch, PatchedModel};
use crate::preview::{LatentPreviewer, PreviewConfig, PreviewCounts, PreviewDecoder, PreviewTransport};
use crate::resident::{ModelSlot, ResidentModels};
use crate::sampler::SamplerKind;
use crate::schedule::SigmaSchedule;

/// Steps of the refinement pass
pub const REFINE_STEPS: usize = 5;

/// Denoise strength of the refinement pass
pub const REFINE_DENOISE: f32 = 0.49;

/// Latent to pixel frames through the VAE
pub trait LatentDecoder<B: Backend> {
    fn decode(&self, vae: &dyn VideoVae<B>, latent: Tensor<B, 5>) -> Result<Tensor<B, 4>, SampleError>;
}

/// Whole-latent decode
#[derive(Debug, Clone, Copy, Default)]
pub struct FullDecode;

impl<B: Backend> LatentDecoder<B> for FullDecode {
    fn decode(&self, vae: &dyn VideoVae<B>, latent: Tensor<B, 5>) -> Result<Tensor<B, 4>, SampleError> {
        info!("Decoding latent with the default VAE path");
        vae.decode(latent)
    }
}

/// Spatially tiled decode, shrinking the tile on out-of-memory
#[derive(Debug, Clone, Copy)]
pub struct TiledDecode {
    pub tile_size: usize,
}

impl<B: Backend> LatentDecoder<B> for TiledDecode {
    fn decode(&self, vae: &dyn VideoVae<B>, latent: Tensor<B, 5>) -> Result<Tensor<B, 4>, SampleError> {
        info!("Decoding latent in {}px tiles", self.tile_size);
        retry_tiled(self.tile_size, self.tile_size.min(MIN_TILE), |tile| {
            vae.decode_tiled(latent.clone(), tile)
        })
    }
}

/// Decode strategy for a decode mode
pub fn latent_decoder<B: Backend>(mode: VaeDecodeMode, tile_size: usize) -> Box<dyn LatentDecoder<B>> {
    match mode {
        VaeDecodeMode::Default => Box::new(FullDecode),
        VaeDecodeMode::Tiled => Box::new(TiledDecode { tile_size }),
    }
}

/// Patches derived from a generation config, in chain order
pub fn model_patches(video: &VideoConfig, settings: &PatchSettings) -> Result<Vec<ModelPatch>, ConfigError> {
    Ok(vec![
        ModelPatch::ScheduleShift {
            shift: video.flow_shift,
        },
        ModelPatch::Enhance(EnhanceVideo::new(video.enhance_strength, video.latent_frames())),
        ModelPatch::SkipLayer(SkipLayerGuidance::new(
            video.skip_layers()?,
            video.skip_start_percent,
            video.skip_end_percent,
        )),
        ModelPatch::CfgZeroStar(CfgZeroStar::new(video.cfg_zero_steps)),
        ModelPatch::TeaCache(settings.teacache),
        ModelPatch::Compile(settings.compile_model),
    ])
}

/// One generation
pub struct GenerateRequest<B: Backend> {
    pub video: VideoConfig,
    pub settings: SamplerSettings,
    /// Guide frames `[N, H, W, 3]` in [0, 1] for image-to-video models
    pub start_image: Option<Tensor<B, 4>>,
    pub end_image: Option<Tensor<B, 4>>,
    /// Listener for live previews
    pub preview: Option<Box<dyn PreviewTransport>>,
}

impl<B: Backend> GenerateRequest<B> {
    pub fn new(video: VideoConfig, settings: SamplerSettings) -> Self {
        Self {
            video,
            settings,
            start_image: None,
            end_image: None,
            preview: None,
        }
    }

    pub fn with_start_image(mut self, image: Tensor<B, 4>) -> Self {
        self.start_image = Some(image);
        self
    }

    pub fn with_end_image(mut self, image: Tensor<B, 4>) -> Self {
        self.end_image = Some(image);
        self
    }

    pub fn with_preview(mut self, transport: Box<dyn PreviewTransport>) -> Self {
        self.preview = Some(transport);
        self
    }
}

/// Result of a generation
#[derive(Debug, Clone)]
pub struct GenerationOutput<B: Backend> {
    /// Decoded frames `[F, H, W, 3]` in [0, 1]
    pub images: Tensor<B, 4>,
    /// Sampled latent `[1, 16, T, H/8, W/8]`
    pub latent: Tensor<B, 5>,
    /// Last denoised estimate, decoded in place of `latent` when present
    pub denoised: Option<Tensor<B, 5>>,
    /// Preview stream counters, when previews were requested
    pub preview: Option<PreviewCounts>,
}

/// Wan 2.1 video generation pipeline
pub struct VideoPipeline<B: Backend> {
    model: PatchedModel<B>,
    text_encoder: Arc<dyn TextEncoder<B>>,
    vision_encoder: Option<Arc<dyn VisionEncoder<B>>>,
    vae: Arc<dyn VideoVae<B>>,
    preview_decoder: Option<Arc<dyn PreviewDecoder<B>>>,
    resident: Option<Arc<ResidentModels>>,
    patch_settings: PatchSettings,
    variant: ModelVariant,
    device: B::Device,
}

impl<B: Backend> VideoPipeline<B> {
    pub fn builder(device: B::Device) -> PipelineBuilder<B> {
        PipelineBuilder::new(device)
    }

    pub fn model(&self) -> &PatchedModel<B> {
        &self.model
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    /// Apply the patches a generation config asks for
    ///
    /// Patches identical to the ones already applied are left in place.
    pub fn configure(&mut self, video: &VideoConfig) -> Result<(), ConfigError> {
        for patch in model_patches(video, &self.patch_settings)? {
            self.model.patch(patch);
        }
        Ok(())
    }

    /// Generate a video
    pub fn generate(&mut self, request: GenerateRequest<B>) -> Result<GenerationOutput<B>, SampleError> {
        let control = GenerationControl::new();
        self.generate_with_control(request, &control)
    }

    /// Generate with pause/cancel control
    pub fn generate_with_control(
        &mut self,
        request: GenerateRequest<B>,
        control: &GenerationControl,
    ) -> Result<GenerationOutput<B>, SampleError> {
        let GenerateRequest {
            video,
            settings,
            start_image,
            end_image,
            preview,
        } = request;
        video.validate()?;
        settings.validate()?;
        // The diffusion model stays resident while this run uses it
        let resident = self.resident.clone();
        let _pinned = resident.as_ref().map(|resident| resident.pin(ModelSlot::Diffusion));
        self.configure(&video)?;

        let image_to_video = self.variant.is_image_to_video() && start_image.is_some();
        if start_image.is_some() && !image_to_video {
            warn!("Start image ignored: {} is not an image-to-video model", self.model.name());
        }
        let (width, height) = match (&start_image, image_to_video) {
            (Some(image), true) => frame_size(image)?,
            _ => (video.width, video.height),
        };
        let frames = video.frames();
        let latent_frames = video.latent_frames();
        info!("Final resolution: {} x {}, {} frames", width, height, frames);

        let positive = Conditioning::new(self.text_encoder.encode(&video.positive)?);
        let negative = Conditioning::new(self.text_encoder.encode(&video.negative)?);
        self.text_encoder.offload();

        let shape = [
            1,
            LATENT_CHANNELS,
            latent_frames,
            height / SPATIAL_COMPRESSION,
            width / SPATIAL_COMPRESSION,
        ];
        let latent_image = Tensor::<B, 5>::zeros(shape, &self.device);

        let (positive, negative) = match start_image {
            Some(start) if image_to_video => {
                let vision = match &self.vision_encoder {
                    Some(encoder) => {
                        let [n, h, w, c] = start.dims();
                        let first = start.clone().slice([0..n.min(1), 0..h, 0..w, 0..c]);
                        let embedding = encoder.encode(imageops::fit_center(first, 224, 224))?;
                        encoder.offload();
                        Some(embedding)
                    }
                    None => None,
                };
                let guide = encode_guide_frames(
                    self.vae.as_ref(),
                    width,
                    height,
                    frames,
                    Some(start),
                    end_image,
                    &self.device,
                )?;
                self.vae.offload();
                let attachments = guide.attachments(vision);
                (
                    positive.with_values(attachments.clone()),
                    negative.with_values(attachments),
                )
            }
            _ => (positive, negative),
        };

        let sampling = self.model.model_sampling();
        let sigmas = SigmaSchedule::calculate(&sampling, settings.scheduler, video.sampling_steps)?;
        let noise = NoiseSource::random(settings.seed);

        let mut previewer = match (preview, &self.preview_decoder) {
            (Some(transport), Some(decoder)) => {
                let config = PreviewConfig::new()
                    .with_rate(settings.preview_rate)
                    .with_resolution(settings.preview_resolution);
                Some(LatentPreviewer::new(config, decoder.clone(), transport))
            }
            (Some(_), None) => {
                warn!("No preview decoder loaded, previews disabled");
                None
            }
            _ => None,
        };

        let mut no_observer = NoObserver;
        let guider = CfgGuider::new(&self.model, &positive, &negative)
            .with_cfg(video.guidance_scale, video.guidance_percent)
            .with_control(control);
        let mut output = {
            let observer: &mut dyn StepObserver<B> = match previewer.as_mut() {
                Some(previewer) => previewer,
                None => &mut no_observer,
            };
            guider.sample(
                noise.generate(shape, &self.device),
                latent_image,
                settings.sampler,
                &sigmas,
                None,
                observer,
                settings.seed,
            )?
        };

        if settings.denoised_output {
            info!("Refining with {} steps at denoise {}", REFINE_STEPS, REFINE_DENOISE);
            let refine_sigmas =
                SigmaSchedule::with_denoise(&sampling, settings.scheduler, REFINE_STEPS, REFINE_DENOISE)?;
            let refiner = CfgGuider::new(&self.model, &positive, &negative)
                .with_cfg(1.0, 1.0)
                .with_control(control);
            if let Some(previewer) = previewer.as_mut() {
                previewer.reset();
            }
            let observer: &mut dyn StepObserver<B> = match previewer.as_mut() {
                Some(previewer) => previewer,
                None => &mut no_observer,
            };
            output = refiner.sample(
                noise.generate(shape, &self.device),
                output.latent,
                SamplerKind::Dpmpp2m,
                &refine_sigmas,
                None,
                observer,
                settings.seed,
            )?;
        }
        let preview = previewer.map(|previewer| previewer.finish());

        let images = self.decode(&output, &settings)?;

        if settings.unload_all_models {
            match &self.resident {
                Some(resident) => {
                    resident.unload_all();
                }
                None => warn!("No resident model set to unload"),
            }
        }

        let SampleOutput { latent, denoised } = output;
        Ok(GenerationOutput {
            images,
            latent,
            denoised,
            preview,
        })
    }

    fn decode(&self, output: &SampleOutput<B>, settings: &SamplerSettings) -> Result<Tensor<B, 4>, SampleError> {
        let target = output.denoised.clone().unwrap_or_else(|| output.latent.clone());
        let decoder = latent_decoder::<B>(settings.vae_decode_type, settings.vae_tile_size);
        let images = decoder.decode(self.vae.as_ref(), target)?;
        self.vae.offload();
        Ok(images.clamp(0.0, 1.0))
    }

    /// Estimate memory of a generation
    pub fn estimate_memory(&self, video: &VideoConfig) -> MemoryEstimate {
        let elem_bytes = std::mem::size_of::<B::FloatElem>();
        let (h, w) = (video.height / SPATIAL_COMPRESSION, video.width / SPATIAL_COMPRESSION);
        let latent_t = video.latent_frames();

        // Patchified 1x2x2 tokens
        let num_tokens = latent_t * (h / 2) * (w / 2);
        let latent_bytes = LATENT_CHANNELS * latent_t * h * w * elem_bytes;
        // noise, latent image, x, denoised, both predictions, solver history
        let working_set = latent_bytes * 7;
        let decoded_bytes = video.frames() * video.height * video.width * 3 * elem_bytes;

        MemoryEstimate {
            model_memory_bytes: self.model.base().size_bytes() as usize,
            peak_activation_bytes: working_set + decoded_bytes,
            latent_bytes,
            num_tokens,
        }
    }
}

/// Output size of an image-to-video run: the start image rounded down to the latent grid
fn frame_size<B: Backend>(image: &Tensor<B, 4>) -> Result<(usize, usize), ConfigError> {
    let [_, h, w, _] = image.dims();
    let width = w - w % SPATIAL_COMPRESSION;
    let height = h - h % SPATIAL_COMPRESSION;
    if width == 0 || height == 0 {
        return Err(ConfigError::InvalidValue {
            name: "start_image",
            reason: format!("{}x{} is smaller than one latent cell", w, h),
        });
    }
    Ok((width, height))
}

/// Memory usage estimate for video generation
#[derive(Debug, Clone)]
pub struct MemoryEstimate {
    /// Model weights memory in bytes
    pub model_memory_bytes: usize,
    /// Peak activation memory in bytes
    pub peak_activation_bytes: usize,
    /// One latent tensor in bytes
    pub latent_bytes: usize,
    /// Number of tokens in sequence
    pub num_tokens: usize,
}

impl MemoryEstimate {
    /// Total estimated memory in bytes
    pub fn total_bytes(&self) -> usize {
        self.model_memory_bytes + self.peak_activation_bytes
    }

    /// Total estimated memory in GB
    pub fn total_gb(&self) -> f64 {
        self.total_bytes() as f64 / 1e9
    }
}

/// Builder for [`VideoPipeline`]
pub struct PipelineBuilder<B: Backend> {
    model: Option<Arc<dyn DiffusionModel<B>>>,
    text_encoder: Option<Arc<dyn TextEncoder<B>>>,
    vision_encoder: Option<Arc<dyn VisionEncoder<B>>>,
    vae: Option<Arc<dyn VideoVae<B>>>,
    preview_decoder: Option<Arc<dyn PreviewDecoder<B>>>,
    resident: Option<Arc<ResidentModels>>,
    patch_settings: PatchSettings,
    device: B::Device,
}

impl<B: Backend> PipelineBuilder<B> {
    /// Create a new pipeline builder
    pub fn new(device: B::Device) -> Self {
        Self {
            model: None,
            text_encoder: None,
            vision_encoder: None,
            vae: None,
            preview_decoder: None,
            resident: None,
            patch_settings: PatchSettings::default(),
            device,
        }
    }

    /// Builder populated from the loader's resident models
    pub fn from_loader(loader: &ModelLoader<B>, loaded: LoadedModel<B>, device: B::Device) -> Result<Self, ModelLoadError> {
        let mut builder = Self::new(device)
            .with_model(loaded.model)
            .with_text_encoder(loader.text_encoder()?)
            .with_vae(loader.vae()?)
            .with_preview_decoder(loader.preview_decoder()?)
            .with_resident(loader.resident().clone());
        if loaded.variant.is_image_to_video() {
            builder = builder.with_vision_encoder(loader.vision_encoder()?);
        }
        Ok(builder)
    }

    /// Set the diffusion model
    pub fn with_model(mut self, model: Arc<dyn DiffusionModel<B>>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_text_encoder(mut self, encoder: Arc<dyn TextEncoder<B>>) -> Self {
        self.text_encoder = Some(encoder);
        self
    }

    pub fn with_vision_encoder(mut self, encoder: Arc<dyn VisionEncoder<B>>) -> Self {
        self.vision_encoder = Some(encoder);
        self
    }

    pub fn with_vae(mut self, vae: Arc<dyn VideoVae<B>>) -> Self {
        self.vae = Some(vae);
        self
    }

    pub fn with_preview_decoder(mut self, decoder: Arc<dyn PreviewDecoder<B>>) -> Self {
        self.preview_decoder = Some(decoder);
        self
    }

    /// Resident set released by `unload_all_models`
    pub fn with_resident(mut self, resident: Arc<ResidentModels>) -> Self {
        self.resident = Some(resident);
        self
    }

    /// Step cache and compile patches
    pub fn with_patch_settings(mut self, settings: PatchSettings) -> Self {
        self.patch_settings = settings;
        self
    }

    /// Build the pipeline
    pub fn build(self) -> Result<VideoPipeline<B>, PipelineBuildError> {
        let model = self.model.ok_or(PipelineBuildError::MissingModel)?;
        let text_encoder = self.text_encoder.ok_or(PipelineBuildError::MissingTextEncoder)?;
        let vae = self.vae.ok_or(PipelineBuildError::MissingVae)?;
        let variant = ModelVariant::from_model_name(model.name());
        if variant.is_image_to_video() && self.vision_encoder.is_none() {
            warn!("{} is image-to-video but no vision encoder is set", model.name());
        }

        Ok(VideoPipeline {
            model: PatchedModel::new(model),
            text_encoder,
            vision_encoder: self.vision_encoder,
            vae,
            preview_decoder: self.preview_decoder,
            resident: self.resident,
            patch_settings: self.patch_settings,
            variant,
            device: self.device,
        })
    }
}

/// Pipeline build errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineBuildError {
    #[error("No diffusion model set")]
    MissingModel,
    #[error("No text encoder set")]
    MissingTextEncoder,
    #[error("No VAE set")]
    MissingVae,
}
