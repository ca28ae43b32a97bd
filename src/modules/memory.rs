//! Device memory guard
//!
//! Memory-heavy operations ask the guard for headroom first. The guard
//! evicts idle resident models until the estimate fits, and tiled
//! operations that still run out of memory are retried with half the tile
//! size down to [`MIN_TILE`].

use tracing::{debug, info, warn};

use crate::error::{ResourceError, SampleError};

/// Smallest tile a tiled operation may shrink to
pub const MIN_TILE: usize = 128;

/// Free/total memory of the accelerator
pub trait DeviceMemory: Send + Sync {
    fn free_bytes(&self) -> u64;
    fn total_bytes(&self) -> u64;
}

/// Something that can release idle device allocations on request
pub trait Evict {
    /// Release the least recently used evictable entry; returns the bytes
    /// freed, or `None` when nothing is left to evict
    fn evict_one(&self) -> Option<u64>;
}

/// Memory headroom for a device with no accounting (CPU backends)
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl DeviceMemory for Unbounded {
    fn free_bytes(&self) -> u64 {
        u64::MAX
    }

    fn total_bytes(&self) -> u64 {
        u64::MAX
    }
}

/// Memory configuration for video generation
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Bytes kept free on top of every estimate
    pub reserved_bytes: u64,
    /// Decode the final latent in spatial tiles
    pub vae_tiling: bool,
    /// VAE tile size in pixels
    pub vae_tile_size: usize,
    /// Initial upscale tile size in pixels
    pub upscale_tile: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            reserved_bytes: 0,
            vae_tiling: false,
            vae_tile_size: 192,
            upscale_tile: 512,
        }
    }
}

impl MemoryConfig {
    /// Low memory configuration for systems with <16GB VRAM
    pub fn low_memory() -> Self {
        Self {
            reserved_bytes: 1 << 30,
            vae_tiling: true,
            vae_tile_size: 128,
            upscale_tile: 256,
        }
    }

    /// Medium memory configuration for 16-32GB VRAM
    pub fn medium_memory() -> Self {
        Self {
            reserved_bytes: 512 << 20,
            vae_tiling: true,
            vae_tile_size: 192,
            upscale_tile: 512,
        }
    }

    /// High memory configuration for 32GB+ VRAM
    pub fn high_memory() -> Self {
        Self::default()
    }
}

/// Evicts resident models to make room and enforces the tile floor
pub struct ResourceGuard<'a> {
    memory: &'a dyn DeviceMemory,
    reserved_bytes: u64,
}

impl<'a> ResourceGuard<'a> {
    pub fn new(memory: &'a dyn DeviceMemory, config: &MemoryConfig) -> Self {
        Self {
            memory,
            reserved_bytes: config.reserved_bytes,
        }
    }

    /// Evict until `estimated_bytes` (plus the reserve) fit in free memory
    pub fn ensure_capacity(&self, estimated_bytes: u64, evict: &dyn Evict) -> Result<(), ResourceError> {
        let requested = estimated_bytes.saturating_add(self.reserved_bytes);
        let mut freed_total = 0u64;
        loop {
            let available = self.memory.free_bytes();
            if available >= requested {
                if freed_total > 0 {
                    info!(
                        "Freed {:.2} GB to fit {:.2} GB",
                        freed_total as f64 / 1e9,
                        requested as f64 / 1e9
                    );
                }
                return Ok(());
            }
            match evict.evict_one() {
                Some(freed) => {
                    debug!("Evicted {} bytes, {} available", freed, available);
                    freed_total += freed;
                }
                None => {
                    return Err(ResourceError::InsufficientMemory { requested, available });
                }
            }
        }
    }
}

/// Run a tiled operation, halving the tile on out-of-memory
///
/// Only [`ResourceError::OutOfMemory`] is retried. A failure at a tile whose
/// half would fall below `min_tile` surfaces as [`ResourceError::TileFloor`].
pub fn retry_tiled<T, F>(initial_tile: usize, min_tile: usize, mut op: F) -> Result<T, SampleError>
where
    F: FnMut(usize) -> Result<T, SampleError>,
{
    let mut tile = initial_tile;
    loop {
        match op(tile) {
            Err(err) if err.is_retryable() => {
                let next = tile / 2;
                if next < min_tile {
                    warn!("Out of memory at tile {}, no smaller tile allowed", tile);
                    return Err(ResourceError::TileFloor { tile, min: min_tile }.into());
                }
                warn!("Out of memory at tile {}, retrying with {}", tile, next);
                tile = next;
            }
            other => return other,
        }
    }
}

/// Working set of a tiled single-image upscale
///
/// `model_bytes + tile^2 * 3 * elem_bytes * max(scale, 1) * 384 + input_bytes`
pub fn upscale_working_set(model_bytes: u64, tile: usize, elem_bytes: usize, scale: f32, input_bytes: u64) -> u64 {
    let per_tile = (tile * tile * 3 * elem_bytes) as f64 * scale.max(1.0) as f64 * 384.0;
    model_bytes + per_tile as u64 + input_bytes
}
