//! Model patch building blocks and the device memory guard

pub mod cfg_zero_star;
pub mod enhance;
pub mod memory;
pub mod skip_layer;
pub mod teacache;

pub use cfg_zero_star::CfgZeroStar;
pub use enhance::EnhanceVideo;
pub use memory::{retry_tiled, DeviceMemory, Evict, MemoryConfig, ResourceGuard, MIN_TILE};
pub use skip_layer::{SkipLayerGuidance, SkipLayers};
pub use teacache::{TeaCache, TeaCacheConfig};
