//! Wan 2.1 Video Generation in Burn
//!
//! Sampling, guidance patches, live previews and post-processing for the
//! Wan 2.1 family of flow-matching video diffusion models. The network
//! architectures themselves (diffusion transformer, text and vision
//! encoders, VAE) are collaborators behind the traits in [`model`].
//!
//! ## Pipeline
//!
//! - **Loader**: resolves weights by name, keeps one instance per model slot
//!   resident and applies up to three LoRA-style adapters
//! - **Patches**: schedule shift, temporal enhancement, skip-layer guidance,
//!   CFG-Zero*, step caching and compilation, layered on the base model
//! - **Sampler**: classifier-free guidance over a sigma schedule with
//!   Euler, Euler ancestral, Heun and DPM++ 2M integrators
//! - **Previews**: rate-limited decoding of the denoised estimate on a
//!   worker thread, streamed as JPEG frames
//! - **Post-processing**: tiled upscaling and frame interpolation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wanflow_burn::{GenerateRequest, SamplerSettings, VideoConfig, VideoPipeline};
//!
//! let mut pipeline = VideoPipeline::builder(device)
//!     .with_model(model)
//!     .with_text_encoder(text_encoder)
//!     .with_vae(vae)
//!     .build()?;
//!
//! let config = VideoConfig::new("A cat playing in a garden".into(), String::new());
//! let output = pipeline.generate(GenerateRequest::new(config, SamplerSettings::new()))?;
//! ```

pub mod conditioning;
pub mod config;
pub mod control;
pub mod error;
pub mod guider;
pub mod imageops;
pub mod load;
pub mod model;
pub mod modules;
pub mod noise;
pub mod patch;
pub mod pipeline;
pub mod postprocess;
pub mod preview;
pub mod resident;
pub mod sampler;
pub mod schedule;

// Re-export main types
pub use conditioning::{encode_guide_frames, Attachment, AttachmentKey, Conditioning};
pub use config::{CompileMode, PatchSettings, SamplerSettings, TeaCacheMode, VaeDecodeMode, VideoConfig};
pub use control::{GenerationControl, GenerationProgress};
pub use error::{ConfigError, ModelLoadError, PreviewError, ResourceError, SampleError};
pub use guider::{CfgGuider, NoObserver, SampleOutput, StepEvent, StepObserver};
pub use imageops::{prepare_guide_image, GuideImageSettings, KeepProportion};
pub use load::{AdapterSpec, LoadedModel, ModelFactory, ModelLoader, ModelVariant, Precision, WeightFormat};
pub use model::{DiffusionModel, TextEncoder, TransformerOptions, VideoVae, VisionEncoder, WeightStore};
pub use modules::memory::{MemoryConfig, ResourceGuard};
pub use noise::NoiseSource;
pub use patch::{ModelPatch, PatchKind, PatchedModel};
pub use pipeline::{GenerateRequest, GenerationOutput, MemoryEstimate, PipelineBuilder, PipelineBuildError, VideoPipeline};
pub use postprocess::{EnhanceSettings, Enhancer, FrameInterpolator, ProcessOrder, Upscaler};
pub use preview::{LatentPreviewer, PreviewConfig, PreviewEvent, PreviewTransport};
pub use resident::{ModelSlot, Pinned, ResidentModels};
pub use sampler::SamplerKind;
pub use schedule::{ModelSampling, SchedulerKind, SigmaSchedule};
