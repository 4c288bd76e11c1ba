//! Top-level per-frame orchestration.

use std::sync::Arc;

use log::{error, info};

use super::synchronizer::{
    FrameContext, FrameOutcome, FrameRecorder, FrameStats, FrameSynchronizer,
};
use crate::camera::CameraState;
use crate::config::RendererConfig;
use crate::error::{RenderError, Result};
use crate::gpu::{GpuResourceProvider, SwapchainInfo};
use crate::light::{LightBuffers, LightRegistry, LightUniforms};
use crate::shadow::{CascadeCalculator, Drawable, ShadowCaster, ShadowShaders};

/// Per-frame inputs handed to the main pass.
pub struct MainPassFrame<'a, G: GpuResourceProvider> {
    pub shadows: &'a ShadowCaster<G>,
    pub lights: LightBuffers,
    pub camera: &'a CameraState,
    pub drawables: &'a [&'a dyn Drawable],
}

/// The pass that renders the scene into the swapchain image using the shadow maps.
pub trait MainPass<G: GpuResourceProvider> {
    fn record(&mut self, gpu: &G, ctx: &FrameContext, frame: &MainPassFrame<'_, G>) -> Result<()>;

    /// Recreates swapchain-sized targets.
    fn rebuild(&mut self, gpu: &G, swapchain: &SwapchainInfo) -> Result<()>;
}

struct DriverRecorder<'a, G: GpuResourceProvider> {
    gpu: &'a G,
    registry: &'a LightRegistry,
    caster: &'a mut ShadowCaster<G>,
    uniforms: &'a mut LightUniforms<G>,
    main_pass: &'a mut Box<dyn MainPass<G>>,
    camera: &'a mut CameraState,
    drawables: &'a [&'a dyn Drawable],
}

impl<G: GpuResourceProvider> FrameRecorder for DriverRecorder<'_, G> {
    fn record(&mut self, ctx: &FrameContext) -> Result<()> {
        self.uniforms.upload(ctx.image_index, self.registry)?;
        self.caster
            .cast(ctx.command_buffer, self.registry, self.drawables);

        let lights = self.uniforms.buffers(ctx.image_index).ok_or_else(|| {
            RenderError::RecordingFailed(format!("no light buffers for image {}", ctx.image_index))
        })?;
        let frame = MainPassFrame {
            shadows: &*self.caster,
            lights,
            camera: &*self.camera,
            drawables: self.drawables,
        };
        self.main_pass.record(self.gpu, ctx, &frame)
    }

    fn rebuild(&mut self, swapchain: &SwapchainInfo) -> Result<()> {
        self.uniforms.rebuild(swapchain.image_count())?;
        self.camera
            .set_aspect_from_extent(swapchain.extent.width, swapchain.extent.height);
        self.main_pass.rebuild(self.gpu, swapchain)
    }
}

/// Owns the light registry, the shadow caster and the frame loop.
///
/// Each [`Self::render_frame`] refreshes cascades from the current camera, uploads
/// the light arrays for the acquired image, records the shadow passes and then the
/// main pass, and submits.
pub struct FrameDriver<G: GpuResourceProvider> {
    // Dropped first: waits for the device before anything else is released.
    synchronizer: FrameSynchronizer<G>,
    gpu: Arc<G>,
    registry: LightRegistry,
    caster: ShadowCaster<G>,
    calculator: CascadeCalculator,
    camera: CameraState,
    uniforms: LightUniforms<G>,
    main_pass: Box<dyn MainPass<G>>,
}

impl<G: GpuResourceProvider> FrameDriver<G> {
    pub fn new(
        gpu: Arc<G>,
        config: RendererConfig,
        shaders: &ShadowShaders,
        mut main_pass: Box<dyn MainPass<G>>,
    ) -> Result<Self> {
        let synchronizer = FrameSynchronizer::new(gpu.clone(), config.frames)?;
        let registry = LightRegistry::new(config.capacity);
        let caster = ShadowCaster::new(gpu.clone(), config.capacity, config.shadows, shaders)?;
        let calculator = CascadeCalculator::from_settings(&config.shadows);

        let swapchain = synchronizer.swapchain().cloned().ok_or_else(|| {
            RenderError::SwapchainCreationFailed("synchronizer has no swapchain".to_string())
        })?;
        let uniforms = LightUniforms::new(gpu.clone(), &registry, swapchain.image_count())?;

        let mut camera = CameraState::default();
        camera.set_aspect_from_extent(swapchain.extent.width, swapchain.extent.height);
        main_pass.rebuild(&gpu, &swapchain)?;

        info!("[FrameDriver] ready on {} backend", gpu.name());
        Ok(Self {
            synchronizer,
            gpu,
            registry,
            caster,
            calculator,
            camera,
            uniforms,
            main_pass,
        })
    }

    pub fn lights(&self) -> &LightRegistry {
        &self.registry
    }

    pub fn lights_mut(&mut self) -> &mut LightRegistry {
        &mut self.registry
    }

    pub fn camera(&self) -> &CameraState {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut CameraState {
        &mut self.camera
    }

    pub fn shadows(&self) -> &ShadowCaster<G> {
        &self.caster
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer<G> {
        &self.synchronizer
    }

    pub fn light_uniforms(&self) -> &LightUniforms<G> {
        &self.uniforms
    }

    pub fn gpu(&self) -> &Arc<G> {
        &self.gpu
    }

    pub fn stats(&self) -> FrameStats {
        self.synchronizer.stats()
    }

    /// Call when the window was resized; handled at the next frame boundary.
    pub fn request_resize(&mut self) {
        self.synchronizer.request_resize();
    }

    /// Renders one frame of `drawables` with the current lights and camera.
    pub fn render_frame(&mut self, drawables: &[&dyn Drawable]) -> Result<FrameOutcome> {
        self.registry.update_cascades(&self.camera, &self.calculator);

        let mut recorder = DriverRecorder {
            gpu: self.gpu.as_ref(),
            registry: &self.registry,
            caster: &mut self.caster,
            uniforms: &mut self.uniforms,
            main_pass: &mut self.main_pass,
            camera: &mut self.camera,
            drawables,
        };
        self.synchronizer.render_one_frame(&mut recorder)
    }
}

impl<G: GpuResourceProvider> Drop for FrameDriver<G> {
    fn drop(&mut self) {
        if let Err(err) = self.gpu.wait_idle() {
            error!("[FrameDriver] wait_idle failed during teardown: {err}");
        }
    }
}
