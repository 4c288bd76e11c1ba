//! Penumbra – lights, shadows and frame pacing for Vulkan renderers.
//!
//! This crate provides the light and shadow core of a real-time renderer:
//! handle-based point and directional lights with bounded shadow-slot pools,
//! cascaded shadow map fitting, the depth-only passes that fill the shadow maps,
//! and a multi-buffered frame loop that drives them. Device bootstrap, asset
//! loading and shading live outside; the crate talks to the GPU only through
//! [`GpuResourceProvider`].

pub mod camera;
pub mod config;
mod error;
pub mod frame;
pub mod gpu;
pub mod light;
pub mod shadow;
pub mod utils;

pub use error::{LightError, RenderError, Result};

pub use glam::{Mat4, Vec3, Vec4};

pub use camera::CameraState;
pub use config::{
    CascadeBounds, FrameConfig, LightCapacity, RendererConfig, ShadowSettings, MAX_CASCADES,
};
pub use frame::{
    FrameContext, FrameDriver, FrameOutcome, FrameRecorder, FrameStats, FrameSynchronizer,
    MainPass, MainPassFrame,
};
pub use gpu::{CommandRecorder, GpuResourceProvider, RecordingBackend};
pub use light::{
    DirectionalLightRecord, LightHandle, LightKind, LightRegistry, PointLightRecord,
    ShadowSlotIndex, ShadowSlotPool,
};
pub use shadow::{CascadeCalculator, CascadeSet, Drawable, ShadowCaster, ShadowShaders};
