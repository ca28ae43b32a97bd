//! Error types for sampling, residency and previews
//!
//! Errors are split by how the caller is expected to react:
//! configuration problems are rejected before any device work, resource
//! exhaustion is retried locally up to a floor, numerical failure aborts the
//! run, and preview failures never leave the preview worker.

use thiserror::Error;

/// Invalid or unsupported configuration, detected before any device work.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Sigma schedule violates its shape or ordering contract
    #[error("Invalid sigma schedule: {0}")]
    InvalidSchedule(String),

    /// Unknown integration method name
    #[error("Unsupported sampler: {0}")]
    UnsupportedSampler(String),

    /// Unknown scheduler name
    #[error("Unsupported scheduler: {0}")]
    UnsupportedScheduler(String),

    /// Skip-layer specifier could not be parsed
    #[error("Malformed skip-layer specifier {spec:?}: {reason}")]
    MalformedSkipLayers { spec: String, reason: String },

    /// Invalid value for a named option
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    /// Tensor shape does not match what the operation requires
    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Device memory exhaustion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// Eviction could not free enough device memory
    #[error("Insufficient device memory: requested {requested} bytes, {available} available")]
    InsufficientMemory { requested: u64, available: u64 },

    /// A tiled operation ran out of memory at the given tile size
    #[error("Out of memory at tile size {tile}")]
    OutOfMemory { tile: usize },

    /// Tile retries reached the minimum tile size
    #[error("Out of memory at tile size {tile}, minimum is {min}")]
    TileFloor { tile: usize, min: usize },
}

/// Failure inside the best-effort preview path.
#[derive(Debug, Error)]
pub enum PreviewError {
    /// Latent could not be decoded to a preview image
    #[error("Preview decode failed: {0}")]
    Decode(String),

    /// Preview image could not be encoded
    #[error("Preview encode failed: {0}")]
    Encode(String),

    /// Transport refused the event
    #[error("Preview transport failed: {0}")]
    Transport(String),

    /// Worker handoff channel is full or closed
    #[error("Preview channel error: {0}")]
    Channel(String),
}

/// Weight resolution and loading errors
#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Error while loading weights: {0}")]
    LoadError(String),
    #[error("Unrecognised file extension")]
    UnknownExtension,
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Stored model has a different type than requested for slot {0}")]
    TypeMismatch(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Errors surfaced by a sampling run.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Load(#[from] ModelLoadError),

    /// NaN or Inf after an integration step
    #[error("Non-finite latent after step {step}")]
    NonFinite { step: usize },

    /// Cancellation flag observed at a step boundary
    #[error("Generation cancelled at step {step}")]
    Cancelled { step: usize },

    /// Opaque collaborator (model, encoder, VAE) failed
    #[error("Model evaluation failed: {0}")]
    Model(String),
}

impl SampleError {
    /// Whether a local retry with a smaller work unit may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SampleError::Resource(ResourceError::OutOfMemory { .. }))
    }
}

/// Result type for sampling operations
pub type Result<T> = std::result::Result<T, SampleError>;
