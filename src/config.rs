//! Generation configuration
//!
//! Three configs mirror the three stages a host graph drives: what to
//! generate ([`VideoConfig`]), how the model is patched ([`PatchSettings`]),
//! and how the sampler runs ([`SamplerSettings`]). All of them are burn
//! [`Config`]s and round-trip through JSON with `save`/`load`.

use std::fmt;
use std::str::FromStr;

use burn::config::Config;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::modules::skip_layer::SkipLayers;
use crate::sampler::SamplerKind;
use crate::schedule::SchedulerKind;

/// Pixel frames per second of the generated clip
pub const BASE_FRAME_RATE: f32 = 16.0;

/// Temporal compression of the video VAE
pub const TEMPORAL_COMPRESSION: usize = 4;

/// Spatial compression of the video VAE
pub const SPATIAL_COMPRESSION: usize = 8;

/// Latent channels of the Wan 2.1 VAE
pub const LATENT_CHANNELS: usize = 16;

/// What to generate and how strongly to guide it
#[derive(Config, Debug)]
pub struct VideoConfig {
    /// Positive prompt (empty lets the model decide)
    pub positive: String,

    /// Negative prompt
    pub negative: String,

    /// Output width in pixels
    #[config(default = 512)]
    pub width: usize,

    /// Output height in pixels
    #[config(default = 512)]
    pub height: usize,

    /// Clip duration in seconds
    #[config(default = 3.0)]
    pub duration: f32,

    /// Classifier-free guidance scale
    #[config(default = 6.0)]
    pub guidance_scale: f32,

    /// Fraction of the schedule during which guidance is active
    #[config(default = 1.0)]
    pub guidance_percent: f32,

    /// Flow shift applied by the schedule remap patch
    #[config(default = 6.0)]
    pub flow_shift: f32,

    /// Number of integration steps
    #[config(default = 20)]
    pub sampling_steps: usize,

    /// Temporal attention enhancement strength (0 disables)
    #[config(default = 0.0)]
    pub enhance_strength: f32,

    /// Steps using the zero-star guidance correction (0 disables)
    #[config(default = 0)]
    pub cfg_zero_steps: usize,

    /// Skip-layer specifier: `"disabled"`, `"9"`, `"9, 10"`
    #[config(default = "String::from(\"disabled\")")]
    pub skip_layer: String,

    /// Start of the skip-layer window as a schedule fraction
    #[config(default = 0.1)]
    pub skip_start_percent: f32,

    /// End of the skip-layer window as a schedule fraction
    #[config(default = 0.9)]
    pub skip_end_percent: f32,
}

impl VideoConfig {
    /// Small, fast configuration for smoke runs
    pub fn preview() -> Self {
        Self::new(String::new(), String::new())
            .with_width(256)
            .with_height(256)
            .with_duration(1.0)
            .with_sampling_steps(8)
    }

    /// 832x480 landscape, the native Wan 480p bucket
    pub fn landscape_480p() -> Self {
        Self::new(String::new(), String::new())
            .with_width(832)
            .with_height(480)
    }

    /// 1280x720 landscape with more steps
    pub fn quality_720p() -> Self {
        Self::new(String::new(), String::new())
            .with_width(1280)
            .with_height(720)
            .with_duration(5.0)
            .with_sampling_steps(30)
    }

    /// Number of pixel frames: `round(duration * 16 + 1)`
    pub fn frames(&self) -> usize {
        (self.duration * BASE_FRAME_RATE + 1.0).round().max(1.0) as usize
    }

    /// Number of latent frames: `((frames - 1) / 4) + 1`
    pub fn latent_frames(&self) -> usize {
        latent_frames_for(self.frames())
    }

    /// Parsed skip-layer set
    pub fn skip_layers(&self) -> Result<SkipLayers, ConfigError> {
        SkipLayers::parse(&self.skip_layer)
    }

    /// Reject values the sampler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_dimension("width", self.width)?;
        validate_dimension("height", self.height)?;

        if !(0.0..=1.0).contains(&self.guidance_percent) {
            return Err(ConfigError::InvalidValue {
                name: "guidance_percent",
                reason: format!("{} is outside [0, 1]", self.guidance_percent),
            });
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "guidance_scale",
                reason: format!("{} must be a non-negative number", self.guidance_scale),
            });
        }
        if self.enhance_strength < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "enhance_strength",
                reason: "must not be negative".into(),
            });
        }
        if self.flow_shift <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "flow_shift",
                reason: format!("{} must be positive", self.flow_shift),
            });
        }
        if self.skip_start_percent > self.skip_end_percent {
            return Err(ConfigError::InvalidValue {
                name: "skip_start_percent",
                reason: format!(
                    "window start {} is after end {}",
                    self.skip_start_percent, self.skip_end_percent
                ),
            });
        }
        self.skip_layers()?;
        Ok(())
    }
}

/// Latent frame count for a pixel frame count
pub fn latent_frames_for(frames: usize) -> usize {
    (frames.saturating_sub(1) / TEMPORAL_COMPRESSION) + 1
}

fn validate_dimension(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 || value % SPATIAL_COMPRESSION != 0 {
        return Err(ConfigError::InvalidValue {
            name,
            reason: format!("{} must be a positive multiple of {}", value, SPATIAL_COMPRESSION),
        });
    }
    Ok(())
}

/// Step cache mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeaCacheMode {
    #[default]
    Disabled,
    /// Cache from the first step
    Normal,
    /// Always evaluate the opening steps, then cache
    Retention,
}

/// Compiled execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMode {
    #[default]
    Disabled,
    Default,
    MaxAutotune,
}

impl CompileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompileMode::Disabled => "disabled",
            CompileMode::Default => "default",
            CompileMode::MaxAutotune => "max-autotune",
        }
    }
}

/// Final VAE decode strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaeDecodeMode {
    #[default]
    Default,
    Tiled,
}

macro_rules! impl_named_enum {
    ($ty:ty, $err:expr, { $($name:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($name => Ok($variant),)+
                    other => Err($err(other.to_string())),
                }
            }
        }
    };
}

impl_named_enum!(TeaCacheMode, |s: String| ConfigError::InvalidValue { name: "teacache", reason: s }, {
    "disabled" => TeaCacheMode::Disabled,
    "normal" => TeaCacheMode::Normal,
    "retention" => TeaCacheMode::Retention,
});

impl_named_enum!(CompileMode, |s: String| ConfigError::InvalidValue { name: "compile_model", reason: s }, {
    "disabled" => CompileMode::Disabled,
    "default" => CompileMode::Default,
    "max-autotune" => CompileMode::MaxAutotune,
});

impl_named_enum!(VaeDecodeMode, |s: String| ConfigError::InvalidValue { name: "vae_decode_type", reason: s }, {
    "default" => VaeDecodeMode::Default,
    "tiled" => VaeDecodeMode::Tiled,
});

impl fmt::Display for VaeDecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaeDecodeMode::Default => write!(f, "default"),
            VaeDecodeMode::Tiled => write!(f, "tiled"),
        }
    }
}

/// Acceleration patches applied on top of the guidance patches
#[derive(Config, Debug)]
pub struct PatchSettings {
    /// Step cache mode
    #[config(default = "TeaCacheMode::Disabled")]
    pub teacache: TeaCacheMode,

    /// Compiled execution mode
    #[config(default = "CompileMode::Disabled")]
    pub compile_model: CompileMode,
}

impl Default for PatchSettings {
    fn default() -> Self {
        Self::new()
    }
}

/// How a sampling run is executed and decoded
#[derive(Config, Debug)]
pub struct SamplerSettings {
    /// Noise seed
    #[config(default = 1234)]
    pub seed: u64,

    /// Integration method
    #[config(default = "SamplerKind::Dpmpp2m")]
    pub sampler: SamplerKind,

    /// Sigma scheduler
    #[config(default = "SchedulerKind::SgmUniform")]
    pub scheduler: SchedulerKind,

    /// Run the short refinement pass after sampling
    #[config(default = false)]
    pub denoised_output: bool,

    /// Final decode strategy
    #[config(default = "VaeDecodeMode::Default")]
    pub vae_decode_type: VaeDecodeMode,

    /// Tile size for tiled decode
    #[config(default = 192)]
    pub vae_tile_size: usize,

    /// Longest side of preview images
    #[config(default = 256)]
    pub preview_resolution: usize,

    /// Preview frames per second of wall time
    #[config(default = 8)]
    pub preview_rate: usize,

    /// Release every resident model when the run finishes
    #[config(default = false)]
    pub unload_all_models: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vae_decode_type == VaeDecodeMode::Tiled && self.vae_tile_size < 64 {
            return Err(ConfigError::InvalidValue {
                name: "vae_tile_size",
                reason: format!("{} is below the minimum of 64", self.vae_tile_size),
            });
        }
        if self.preview_rate == 0 {
            return Err(ConfigError::InvalidValue {
                name: "preview_rate",
                reason: "must be at least 1".into(),
            });
        }
        if self.preview_resolution == 0 {
            return Err(ConfigError::InvalidValue {
                name: "preview_resolution",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
