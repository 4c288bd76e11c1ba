//! Handle-based light storage.
//!
//! Lights live in fixed-capacity pools inside [`LightRegistry`] and are addressed by
//! generation-checked [`LightHandle`]s. Shadow maps are a second, smaller pool: a
//! light either holds a [`ShadowSlotIndex`] or renders unshadowed.

pub mod gpu_data;
pub mod handle;
pub mod pool;
pub mod registry;
pub mod slot_pool;

pub use gpu_data::{GpuDirectionalLight, GpuPointLight, LightBuffers, LightUniforms};
pub use handle::{LightHandle, LightKind};
pub use pool::LightPool;
pub use registry::{DirectionalLightRecord, LightRegistry, PointLightRecord};
pub use slot_pool::{ShadowSlotIndex, ShadowSlotPool};
