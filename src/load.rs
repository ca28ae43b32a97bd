//! Model acquisition
//!
//! Weight files are resolved by name through a [`WeightStore`] and turned
//! into models by a [`ModelFactory`]. Everything loaded goes through the
//! [`ResidentModels`] cache, so a model is loaded at most once per name and
//! stays resident across runs until evicted or unloaded. Before a weight
//! file is read the loader asks the device for room, evicting idle models
//! when the estimate does not fit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ModelLoadError;
use crate::model::{DiffusionModel, TextEncoder, VideoVae, VisionEncoder, WeightStore};
use crate::modules::memory::{DeviceMemory, MemoryConfig, ResourceGuard, Unbounded};
use crate::preview::PreviewDecoder;
use crate::resident::{Loaded, ModelSlot, ResidentModels, ADAPTER_SLOTS};

pub const TEXT_ENCODER_NAME: &str = "umt5_xxl_fp8_e4m3fn_scaled.safetensors";
pub const VISION_ENCODER_NAME: &str = "clip_vision_h.safetensors";
pub const VAE_NAME: &str = "wan_2.1_vae.safetensors";
pub const PREVIEW_DECODER_NAME: &str = "taew2_1.safetensors";

/// Marker that clears an adapter slot
pub const DISABLED: &str = "disabled";

/// On-disk weight format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// ComfyUI/Kijai checkpoints
    Safetensors,
    /// Burn native format
    Burnpack,
    /// Quantised GGUF
    Gguf,
}

impl WeightFormat {
    /// Format from the file extension (no extension means Burnpack)
    pub fn from_path(path: &Path) -> Result<Self, ModelLoadError> {
        let extension = path.extension().map(|s| s.to_string_lossy().to_lowercase());
        match extension.as_deref() {
            Some("safetensors") => Ok(WeightFormat::Safetensors),
            Some("bpk") | None => Ok(WeightFormat::Burnpack),
            Some("gguf") => Ok(WeightFormat::Gguf),
            _ => Err(ModelLoadError::UnknownExtension),
        }
    }
}

/// Storage precision selected from the checkpoint name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Native,
    Fp8E4m3fn,
    /// e4m3fn with fp8 matmul optimisations
    Fp8E4m3fnFast,
    Fp8E5m2,
    Gguf,
}

impl Precision {
    pub fn from_model_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("gguf") {
            Precision::Gguf
        } else if name.contains("e4m3fn_fast") {
            Precision::Fp8E4m3fnFast
        } else if name.contains("e4m3fn") {
            Precision::Fp8E4m3fn
        } else if name.contains("e5m2") {
            Precision::Fp8E5m2
        } else {
            Precision::Native
        }
    }
}

/// Text-to-video or image-to-video checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelVariant {
    #[default]
    TextToVideo,
    ImageToVideo,
}

impl ModelVariant {
    pub fn from_model_name(name: &str) -> Self {
        if name.to_lowercase().contains("i2v") {
            ModelVariant::ImageToVideo
        } else {
            ModelVariant::TextToVideo
        }
    }

    pub fn is_image_to_video(&self) -> bool {
        matches!(self, ModelVariant::ImageToVideo)
    }
}

/// How a diffusion checkpoint should be materialised
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    pub path: PathBuf,
    pub format: WeightFormat,
    pub precision: Precision,
    pub variant: ModelVariant,
}

impl LoadOptions {
    pub fn for_model(name: &str, path: PathBuf) -> Result<Self, ModelLoadError> {
        Ok(Self {
            format: WeightFormat::from_path(&path)?,
            path,
            precision: Precision::from_model_name(name),
            variant: ModelVariant::from_model_name(name),
        })
    }
}

/// One adapter slot request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    /// Adapter file name, or `"disabled"`
    pub name: String,
    pub strength: f32,
}

impl AdapterSpec {
    pub fn new(name: impl Into<String>, strength: f32) -> Self {
        Self {
            name: name.into(),
            strength,
        }
    }

    pub fn disabled() -> Self {
        Self::new(DISABLED, 1.0)
    }

    pub fn is_disabled(&self) -> bool {
        self.name == DISABLED
    }
}

impl Default for AdapterSpec {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Loaded adapter weights; opaque beyond their source
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterWeights {
    pub name: String,
    pub path: PathBuf,
}

/// Builds models from resolved weight files
pub trait ModelFactory<B: Backend>: Send + Sync {
    fn diffusion(&self, options: &LoadOptions) -> Result<Loaded<Arc<dyn DiffusionModel<B>>>, ModelLoadError>;

    fn text_encoder(&self, path: &Path) -> Result<Loaded<Arc<dyn TextEncoder<B>>>, ModelLoadError>;

    fn vision_encoder(&self, path: &Path) -> Result<Loaded<Arc<dyn VisionEncoder<B>>>, ModelLoadError>;

    fn vae(&self, path: &Path) -> Result<Loaded<Arc<dyn VideoVae<B>>>, ModelLoadError>;

    fn preview_decoder(&self, path: &Path) -> Result<Loaded<Arc<dyn PreviewDecoder<B>>>, ModelLoadError>;

    /// Device bytes the model in `path` will occupy once loaded
    ///
    /// Defaults to the size of the weight file.
    fn estimate_bytes(&self, _slot: ModelSlot, path: &Path) -> u64 {
        std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
    }

    /// Read adapter weights
    fn adapter(&self, name: &str, path: &Path) -> Result<Loaded<AdapterWeights>, ModelLoadError> {
        Ok(Loaded::new(
            AdapterWeights {
                name: name.to_string(),
                path: path.to_path_buf(),
            },
            0,
        ))
    }

    /// Merge adapter weights into `model` at `strength`
    fn apply_adapter(
        &self,
        model: Arc<dyn DiffusionModel<B>>,
        adapter: &AdapterWeights,
        strength: f32,
    ) -> Result<Arc<dyn DiffusionModel<B>>, ModelLoadError>;
}

/// Diffusion model ready for patching
pub struct LoadedModel<B: Backend> {
    pub model: Arc<dyn DiffusionModel<B>>,
    pub name: String,
    pub variant: ModelVariant,
    /// Adapters merged into `model`, by slot
    pub applied_adapters: Vec<(usize, String)>,
}

/// Loads models into the resident set
pub struct ModelLoader<B: Backend> {
    store: Arc<dyn WeightStore>,
    factory: Arc<dyn ModelFactory<B>>,
    resident: Arc<ResidentModels>,
    memory: Arc<dyn DeviceMemory>,
    memory_config: MemoryConfig,
}

impl<B: Backend> ModelLoader<B> {
    pub fn new(store: Arc<dyn WeightStore>, factory: Arc<dyn ModelFactory<B>>, resident: Arc<ResidentModels>) -> Self {
        Self {
            store,
            factory,
            resident,
            memory: Arc::new(Unbounded),
            memory_config: MemoryConfig::default(),
        }
    }

    /// Account loads against `memory`, keeping `config.reserved_bytes` free
    pub fn with_memory(mut self, memory: Arc<dyn DeviceMemory>, config: MemoryConfig) -> Self {
        self.memory = memory;
        self.memory_config = config;
        self
    }

    /// Make room for the model in `path`, evicting idle models
    ///
    /// Runs under the slot's load lock, which eviction skips.
    fn reserve(&self, slot: ModelSlot, path: &Path) -> Result<(), ModelLoadError> {
        let estimate = self.factory.estimate_bytes(slot, path);
        ResourceGuard::new(self.memory.as_ref(), &self.memory_config)
            .ensure_capacity(estimate, self.resident.as_ref())?;
        Ok(())
    }

    /// Resolve `name` and reserve room for it
    fn prepare(&self, slot: ModelSlot, name: &str) -> Result<PathBuf, ModelLoadError> {
        let path = self.store.resolve(name)?;
        self.reserve(slot, &path)?;
        Ok(path)
    }

    pub fn resident(&self) -> &Arc<ResidentModels> {
        &self.resident
    }

    /// Load a diffusion model and merge up to three adapters
    pub fn load(&self, model_name: &str, adapters: &[AdapterSpec]) -> Result<LoadedModel<B>, ModelLoadError> {
        if adapters.len() > ADAPTER_SLOTS {
            return Err(ModelLoadError::LoadError(format!(
                "{} adapters requested, at most {} are supported",
                adapters.len(),
                ADAPTER_SLOTS
            )));
        }

        let base = self.resident.get_or_load(ModelSlot::Diffusion, model_name, || {
            let path = self.prepare(ModelSlot::Diffusion, model_name)?;
            let options = LoadOptions::for_model(model_name, path)?;
            info!(
                "Loading diffusion model {} ({:?}, {:?})",
                model_name, options.format, options.precision
            );
            self.factory.diffusion(&options)
        })?;
        let mut model: Arc<dyn DiffusionModel<B>> = base.as_ref().clone();
        let _pinned = self.resident.pin(ModelSlot::Diffusion);

        // Encoders are fetched up front so the first run does not stall on them
        self.text_encoder()?;
        self.vision_encoder()?;
        self.vae()?;
        self.preview_decoder()?;

        let mut applied_adapters = Vec::new();
        for slot in 0..ADAPTER_SLOTS {
            let spec = adapters.get(slot).cloned().unwrap_or_default();
            if let Some(weights) = self.adapter(slot, &spec)? {
                if spec.strength != 0.0 {
                    debug!("Applying {} at strength {}", weights.name, spec.strength);
                    model = self.factory.apply_adapter(model, &weights, spec.strength)?;
                    applied_adapters.push((slot, weights.name.clone()));
                }
            }
        }

        Ok(LoadedModel {
            model,
            name: model_name.to_string(),
            variant: ModelVariant::from_model_name(model_name),
            applied_adapters,
        })
    }

    /// Adapter weights for one slot; `"disabled"` clears the slot
    fn adapter(&self, slot: usize, spec: &AdapterSpec) -> Result<Option<Arc<AdapterWeights>>, ModelLoadError> {
        let key = ModelSlot::Adapter(slot);
        if spec.is_disabled() {
            self.resident.release(key);
            return Ok(None);
        }
        let weights = self.resident.get_or_load(key, &spec.name, || {
            let path = self.prepare(key, &spec.name)?;
            info!("Loaded adapter {} (slot {}, strength {})", spec.name, key, spec.strength);
            self.factory.adapter(&spec.name, &path)
        })?;
        Ok(Some(weights))
    }

    pub fn text_encoder(&self) -> Result<Arc<dyn TextEncoder<B>>, ModelLoadError> {
        let model = self.resident.get_or_load(ModelSlot::TextEncoder, TEXT_ENCODER_NAME, || {
            self.factory.text_encoder(&self.prepare(ModelSlot::TextEncoder, TEXT_ENCODER_NAME)?)
        })?;
        Ok(model.as_ref().clone())
    }

    pub fn vision_encoder(&self) -> Result<Arc<dyn VisionEncoder<B>>, ModelLoadError> {
        let model = self.resident.get_or_load(ModelSlot::VisionEncoder, VISION_ENCODER_NAME, || {
            self.factory.vision_encoder(&self.prepare(ModelSlot::VisionEncoder, VISION_ENCODER_NAME)?)
        })?;
        Ok(model.as_ref().clone())
    }

    pub fn vae(&self) -> Result<Arc<dyn VideoVae<B>>, ModelLoadError> {
        let model = self.resident.get_or_load(ModelSlot::Vae, VAE_NAME, || {
            self.factory.vae(&self.prepare(ModelSlot::Vae, VAE_NAME)?)
        })?;
        Ok(model.as_ref().clone())
    }

    pub fn preview_decoder(&self) -> Result<Arc<dyn PreviewDecoder<B>>, ModelLoadError> {
        let model = self.resident.get_or_load(ModelSlot::PreviewDecoder, PREVIEW_DECODER_NAME, || {
            self.factory.preview_decoder(&self.prepare(ModelSlot::PreviewDecoder, PREVIEW_DECODER_NAME)?)
        })?;
        Ok(model.as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditioning::Conditioning;
    use crate::error::{ResourceError, SampleError};
    use crate::model::TransformerOptions;
    use crate::preview::LatentRgb;
    use burn::backend::NdArray;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    type TestBackend = NdArray<f32>;

    struct Named(String);

    impl DiffusionModel<TestBackend> for Named {
        fn name(&self) -> &str {
            &self.0
        }

        fn forward(
            &self,
            x: Tensor<TestBackend, 5>,
            _timestep: f32,
            _cond: &Conditioning<TestBackend>,
            _options: &TransformerOptions,
        ) -> Result<Tensor<TestBackend, 5>, SampleError> {
            Ok(x)
        }
    }

    struct Unused;

    impl TextEncoder<TestBackend> for Unused {
        fn encode(&self, _text: &str) -> Result<Tensor<TestBackend, 3>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }
    }

    impl VisionEncoder<TestBackend> for Unused {
        fn encode(&self, _image: Tensor<TestBackend, 4>) -> Result<Tensor<TestBackend, 3>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }
    }

    impl VideoVae<TestBackend> for Unused {
        fn encode(&self, _frames: Tensor<TestBackend, 4>) -> Result<Tensor<TestBackend, 5>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }

        fn decode(&self, _latent: Tensor<TestBackend, 5>) -> Result<Tensor<TestBackend, 4>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }

        fn decode_tiled(&self, _latent: Tensor<TestBackend, 5>, _tile: usize) -> Result<Tensor<TestBackend, 4>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }
    }

    struct LocalStore;

    impl WeightStore for LocalStore {
        fn resolve(&self, name: &str) -> Result<PathBuf, ModelLoadError> {
            if name.starts_with("missing") {
                return Err(ModelLoadError::UnknownModel(name.to_string()));
            }
            Ok(PathBuf::from("/models").join(name))
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        calls: Mutex<Vec<String>>,
    }

    impl ModelFactory<TestBackend> for RecordingFactory {
        fn diffusion(&self, options: &LoadOptions) -> Result<Loaded<Arc<dyn DiffusionModel<TestBackend>>>, ModelLoadError> {
            let name = options.path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            self.calls.lock().push(format!("diffusion {name}"));
            Ok(Loaded::new(Arc::new(Named(name)), 1000))
        }

        fn text_encoder(&self, _path: &Path) -> Result<Loaded<Arc<dyn TextEncoder<TestBackend>>>, ModelLoadError> {
            self.calls.lock().push("text".into());
            Ok(Loaded::new(Arc::new(Unused), 10))
        }

        fn vision_encoder(&self, _path: &Path) -> Result<Loaded<Arc<dyn VisionEncoder<TestBackend>>>, ModelLoadError> {
            self.calls.lock().push("vision".into());
            Ok(Loaded::new(Arc::new(Unused), 10))
        }

        fn vae(&self, _path: &Path) -> Result<Loaded<Arc<dyn VideoVae<TestBackend>>>, ModelLoadError> {
            self.calls.lock().push("vae".into());
            Ok(Loaded::new(Arc::new(Unused), 10))
        }

        fn preview_decoder(&self, _path: &Path) -> Result<Loaded<Arc<dyn PreviewDecoder<TestBackend>>>, ModelLoadError> {
            self.calls.lock().push("preview".into());
            Ok(Loaded::new(Arc::new(LatentRgb::wan21(&Default::default())), 1))
        }

        fn adapter(&self, name: &str, path: &Path) -> Result<Loaded<AdapterWeights>, ModelLoadError> {
            self.calls.lock().push(format!("adapter {name}"));
            Ok(Loaded::new(
                AdapterWeights {
                    name: name.to_string(),
                    path: path.to_path_buf(),
                },
                5,
            ))
        }

        fn apply_adapter(
            &self,
            model: Arc<dyn DiffusionModel<TestBackend>>,
            adapter: &AdapterWeights,
            strength: f32,
        ) -> Result<Arc<dyn DiffusionModel<TestBackend>>, ModelLoadError> {
            self.calls.lock().push(format!("apply {} {}", adapter.name, strength));
            Ok(Arc::new(Named(format!("{}+{}", model.name(), adapter.name))))
        }
    }

    fn loader() -> (ModelLoader<TestBackend>, Arc<RecordingFactory>) {
        let factory = Arc::new(RecordingFactory::default());
        let loader = ModelLoader::new(Arc::new(LocalStore), factory.clone(), Arc::new(ResidentModels::new()));
        (loader, factory)
    }

    #[test]
    fn test_weight_format_from_extension() {
        assert_eq!(WeightFormat::from_path(Path::new("a.safetensors")).unwrap(), WeightFormat::Safetensors);
        assert_eq!(WeightFormat::from_path(Path::new("a.BPK")).unwrap(), WeightFormat::Burnpack);
        assert_eq!(WeightFormat::from_path(Path::new("a")).unwrap(), WeightFormat::Burnpack);
        assert_eq!(WeightFormat::from_path(Path::new("a.Q4_K_M.gguf")).unwrap(), WeightFormat::Gguf);
        assert!(matches!(
            WeightFormat::from_path(Path::new("a.ckpt")),
            Err(ModelLoadError::UnknownExtension)
        ));
    }

    #[test]
    fn test_precision_from_name() {
        assert_eq!(
            Precision::from_model_name("wan2.1_t2v_14B_fp8_e4m3fn.safetensors"),
            Precision::Fp8E4m3fn
        );
        assert_eq!(
            Precision::from_model_name("wan2.1_t2v_14B_fp8_e4m3fn_fast.safetensors"),
            Precision::Fp8E4m3fnFast
        );
        assert_eq!(Precision::from_model_name("wan2.1_t2v_1.3B_fp8_e5m2.safetensors"), Precision::Fp8E5m2);
        assert_eq!(Precision::from_model_name("wan2.1-i2v-14b-480p-Q4_K_M.gguf"), Precision::Gguf);
        assert_eq!(Precision::from_model_name("wan2.1_t2v_1.3B_bf16.safetensors"), Precision::Native);
    }

    #[test]
    fn test_variant_from_name() {
        assert!(ModelVariant::from_model_name("wan2.1_i2v_480p_14B_fp8_e4m3fn.safetensors").is_image_to_video());
        assert!(!ModelVariant::from_model_name("wan2.1_t2v_1.3B_bf16.safetensors").is_image_to_video());
    }

    #[test]
    fn test_model_loaded_once_per_name() {
        let (loader, factory) = loader();
        loader.load("wan2.1_t2v_1.3B_bf16.safetensors", &[]).unwrap();
        loader.load("wan2.1_t2v_1.3B_bf16.safetensors", &[]).unwrap();
        let calls = factory.calls.lock().clone();
        assert_eq!(calls.iter().filter(|c| c.starts_with("diffusion")).count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "vae").count(), 1);
    }

    #[test]
    fn test_adapters_applied_in_slot_order() {
        let (loader, factory) = loader();
        let loaded = loader
            .load(
                "wan2.1_t2v_1.3B_bf16.safetensors",
                &[
                    AdapterSpec::new("style.safetensors", 0.8),
                    AdapterSpec::new("motion.safetensors", 0.0),
                    AdapterSpec::new("detail.safetensors", -1.0),
                ],
            )
            .unwrap();

        assert_eq!(loaded.model.name(), "wan2.1_t2v_1.3B_bf16.safetensors+style.safetensors+detail.safetensors");
        assert_eq!(
            loaded.applied_adapters,
            vec![(0, "style.safetensors".to_string()), (2, "detail.safetensors".to_string())]
        );
        // Zero strength still loads the slot
        assert!(factory.calls.lock().contains(&"adapter motion.safetensors".to_string()));
        assert!(loader.resident().contains(ModelSlot::Adapter(1)));
    }

    #[test]
    fn test_disabled_clears_adapter_slot() {
        let (loader, _) = loader();
        let name = "wan2.1_t2v_1.3B_bf16.safetensors";
        loader.load(name, &[AdapterSpec::new("style.safetensors", 1.0)]).unwrap();
        assert!(loader.resident().contains(ModelSlot::Adapter(0)));

        let loaded = loader.load(name, &[AdapterSpec::disabled()]).unwrap();
        assert!(!loader.resident().contains(ModelSlot::Adapter(0)));
        assert!(loaded.applied_adapters.is_empty());
        assert_eq!(loaded.model.name(), name);
    }

    #[test]
    fn test_unresolvable_model_leaves_no_entry() {
        let (loader, _) = loader();
        assert!(loader.load("missing_model.safetensors", &[]).is_err());
        assert!(!loader.resident().contains(ModelSlot::Diffusion));
    }

    /// Device with a fixed capacity; models add their size on load and
    /// give it back when dropped
    struct MeteredDevice {
        capacity: u64,
        used: AtomicU64,
        log: Mutex<Vec<String>>,
    }

    impl DeviceMemory for MeteredDevice {
        fn free_bytes(&self) -> u64 {
            self.capacity.saturating_sub(self.used.load(Ordering::SeqCst))
        }

        fn total_bytes(&self) -> u64 {
            self.capacity
        }
    }

    struct Metered {
        name: String,
        bytes: u64,
        device: Arc<MeteredDevice>,
    }

    impl Metered {
        fn load(device: &Arc<MeteredDevice>, name: &str, bytes: u64) -> Arc<Self> {
            device.used.fetch_add(bytes, Ordering::SeqCst);
            device.log.lock().push(format!("load {name}"));
            Arc::new(Self {
                name: name.to_string(),
                bytes,
                device: device.clone(),
            })
        }
    }

    impl Drop for Metered {
        fn drop(&mut self) {
            self.device.used.fetch_sub(self.bytes, Ordering::SeqCst);
            self.device.log.lock().push(format!("drop {}", self.name));
        }
    }

    impl DiffusionModel<TestBackend> for Metered {
        fn name(&self) -> &str {
            &self.name
        }

        fn forward(
            &self,
            x: Tensor<TestBackend, 5>,
            _timestep: f32,
            _cond: &Conditioning<TestBackend>,
            _options: &TransformerOptions,
        ) -> Result<Tensor<TestBackend, 5>, SampleError> {
            Ok(x)
        }
    }

    impl TextEncoder<TestBackend> for Metered {
        fn encode(&self, _text: &str) -> Result<Tensor<TestBackend, 3>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }
    }

    impl VisionEncoder<TestBackend> for Metered {
        fn encode(&self, _image: Tensor<TestBackend, 4>) -> Result<Tensor<TestBackend, 3>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }
    }

    impl VideoVae<TestBackend> for Metered {
        fn encode(&self, _frames: Tensor<TestBackend, 4>) -> Result<Tensor<TestBackend, 5>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }

        fn decode(&self, _latent: Tensor<TestBackend, 5>) -> Result<Tensor<TestBackend, 4>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }

        fn decode_tiled(&self, _latent: Tensor<TestBackend, 5>, _tile: usize) -> Result<Tensor<TestBackend, 4>, SampleError> {
            Err(SampleError::Model("unused".into()))
        }
    }

    /// Diffusion models are 1000 bytes plus 50 for "large" names, everything
    /// else 30
    struct MeteredFactory {
        device: Arc<MeteredDevice>,
    }

    impl MeteredFactory {
        fn size(slot: ModelSlot, path: &Path) -> u64 {
            match slot {
                ModelSlot::Diffusion if path.to_string_lossy().contains("large") => 1050,
                ModelSlot::Diffusion => 1000,
                _ => 30,
            }
        }

        fn loaded(&self, slot: ModelSlot, path: &Path) -> Loaded<Arc<Metered>> {
            let bytes = Self::size(slot, path);
            Loaded::new(Metered::load(&self.device, &slot.to_string(), bytes), bytes)
        }
    }

    impl ModelFactory<TestBackend> for MeteredFactory {
        fn diffusion(&self, options: &LoadOptions) -> Result<Loaded<Arc<dyn DiffusionModel<TestBackend>>>, ModelLoadError> {
            let loaded = self.loaded(ModelSlot::Diffusion, &options.path);
            Ok(Loaded::new(loaded.value, loaded.size_bytes))
        }

        fn text_encoder(&self, path: &Path) -> Result<Loaded<Arc<dyn TextEncoder<TestBackend>>>, ModelLoadError> {
            let loaded = self.loaded(ModelSlot::TextEncoder, path);
            Ok(Loaded::new(loaded.value, loaded.size_bytes))
        }

        fn vision_encoder(&self, path: &Path) -> Result<Loaded<Arc<dyn VisionEncoder<TestBackend>>>, ModelLoadError> {
            let loaded = self.loaded(ModelSlot::VisionEncoder, path);
            Ok(Loaded::new(loaded.value, loaded.size_bytes))
        }

        fn vae(&self, path: &Path) -> Result<Loaded<Arc<dyn VideoVae<TestBackend>>>, ModelLoadError> {
            let loaded = self.loaded(ModelSlot::Vae, path);
            Ok(Loaded::new(loaded.value, loaded.size_bytes))
        }

        fn preview_decoder(&self, _path: &Path) -> Result<Loaded<Arc<dyn PreviewDecoder<TestBackend>>>, ModelLoadError> {
            Ok(Loaded::new(Arc::new(LatentRgb::wan21(&Default::default())), 0))
        }

        fn estimate_bytes(&self, slot: ModelSlot, path: &Path) -> u64 {
            match slot {
                ModelSlot::PreviewDecoder => 0,
                _ => Self::size(slot, path),
            }
        }

        fn apply_adapter(
            &self,
            model: Arc<dyn DiffusionModel<TestBackend>>,
            _adapter: &AdapterWeights,
            _strength: f32,
        ) -> Result<Arc<dyn DiffusionModel<TestBackend>>, ModelLoadError> {
            Ok(model)
        }
    }

    fn metered_loader(capacity: u64) -> (ModelLoader<TestBackend>, Arc<MeteredDevice>) {
        let device = Arc::new(MeteredDevice {
            capacity,
            used: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        });
        let loader = ModelLoader::new(
            Arc::new(LocalStore),
            Arc::new(MeteredFactory { device: device.clone() }),
            Arc::new(ResidentModels::new()),
        )
        .with_memory(device.clone(), MemoryConfig::default());
        (loader, device)
    }

    #[test]
    fn test_idle_encoder_evicted_before_diffusion_load() {
        let (loader, device) = metered_loader(1100);
        drop(loader.vision_encoder().unwrap());
        drop(loader.text_encoder().unwrap());
        assert_eq!(device.free_bytes(), 1040);

        let loaded = loader.load("wan2.1_t2v_14B_large.safetensors", &[]).unwrap();
        assert_eq!(loaded.model.name(), "diffusion_model");

        let log = device.log.lock().clone();
        // The vision encoder is the least recently used and goes first
        assert_eq!(log[..4], ["load clip_vision", "load text_encoder", "drop clip_vision", "load diffusion_model"]);
        assert!(loader.resident().contains(ModelSlot::Diffusion));
        // Model plus the one encoder that still fits
        assert_eq!(device.free_bytes(), 20);
    }

    #[test]
    fn test_load_fails_when_nothing_can_be_evicted() {
        let (loader, device) = metered_loader(500);
        let result = loader.load("wan2.1_t2v_1.3B_bf16.safetensors", &[]);
        assert!(matches!(
            result,
            Err(ModelLoadError::Resource(ResourceError::InsufficientMemory { requested: 1000, available: 500 }))
        ));
        assert!(!loader.resident().contains(ModelSlot::Diffusion));
        assert!(device.log.lock().is_empty());
    }

    #[test]
    fn test_diffusion_model_pinned_while_encoders_load() {
        // Room for the model and one encoder: the second encoder must evict
        // the first rather than the model being set up
        let (loader, device) = metered_loader(1030);
        let loaded = loader.load("wan2.1_t2v_1.3B_bf16.safetensors", &[]).unwrap();
        assert_eq!(loaded.model.name(), "diffusion_model");
        assert!(loader.resident().contains(ModelSlot::Diffusion));
        assert!(!device.log.lock().contains(&"drop diffusion_model".to_string()));
    }

    #[test]
    fn test_too_many_adapters() {
        let (loader, _) = loader();
        let adapters = vec![AdapterSpec::disabled(); 4];
        assert!(loader.load("wan2.1_t2v_1.3B_bf16.safetensors", &adapters).is_err());
    }
}
