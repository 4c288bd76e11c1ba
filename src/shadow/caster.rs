//! Shadow-casting render sequence.
//!
//! `ShadowCaster` owns one GPU shadow map per shadow slot and records the depth-only
//! passes for every light that holds a slot. The registry decides which slots are in
//! use; this type only follows the slot indices it finds on the light records.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use log::{debug, info};

use super::maps::{DirectionalShadowMap, PointShadowMap};
use crate::config::{LightCapacity, ShadowSettings, CUBE_FACES, MAX_CASCADES, POINT_SHADOW_NEAR};
use crate::error::Result;
use crate::gpu::{
    AttachmentDesc, BindingKind, BindingLayout, BufferDesc, BufferHandle, BufferUsage, ClearValue,
    CommandBufferHandle, CommandRecorder, CullMode, DepthBias, DescriptorLayoutDesc,
    DescriptorSetDesc, DescriptorSetHandle, DescriptorWrite, Format, GpuResourceProvider,
    GraphicsPipeline, ImageLayout, ImageTransition, PipelineDesc, PipelineHandle,
    PipelineLayoutHandle, RenderPassDesc, RenderPassHandle, ShaderProgram, ShaderStages, Viewport,
};
use crate::light::LightRegistry;
use crate::utils::timing::SectionTimer;

/// Size of the per-draw model matrix block every drawable pushes at offset 0.
pub const MODEL_PUSH_SIZE: u32 = std::mem::size_of::<[f32; 16]>() as u32;

/// Point light data pushed after the model matrix.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PointShadowPush {
    pub position: [f32; 3],
    pub radius: f32,
    /// Projection depth terms for a 90° perspective reaching `radius`.
    pub p22: f32,
    pub p32: f32,
}

impl PointShadowPush {
    pub fn new(position: Vec3, radius: f32) -> Self {
        let near = POINT_SHADOW_NEAR;
        Self {
            position: position.to_array(),
            radius,
            p22: radius / (near - radius),
            p32: near * radius / (near - radius),
        }
    }
}

/// The six cube-face view matrices, relative to the light position.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CubeFaceViews {
    pub views: [[f32; 16]; CUBE_FACES as usize],
}

impl CubeFaceViews {
    pub fn new() -> Self {
        const FACES: [(Vec3, Vec3); 6] = [
            (Vec3::X, Vec3::NEG_Y),
            (Vec3::NEG_X, Vec3::NEG_Y),
            (Vec3::Y, Vec3::Z),
            (Vec3::NEG_Y, Vec3::NEG_Z),
            (Vec3::Z, Vec3::NEG_Y),
            (Vec3::NEG_Z, Vec3::NEG_Y),
        ];
        Self {
            views: FACES
                .map(|(forward, up)| Mat4::look_to_rh(Vec3::ZERO, forward, up).to_cols_array()),
        }
    }
}

impl Default for CubeFaceViews {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-frame state of a directional shadow map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowMapState {
    /// Not rendered this frame.
    Unused,
    /// Cascades rendered, image still in attachment layout.
    Written,
    /// Transitioned for sampling.
    Readable,
}

/// Geometry that can be rendered into a shadow map.
///
/// Implementors bind their vertex/index buffers, push their model matrix at offset 0
/// of `layout` and issue draws.
pub trait Drawable {
    fn draw_geometry(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
    );
}

/// Shader programs for the two shadow pipelines.
#[derive(Debug, Clone, Default)]
pub struct ShadowShaders {
    pub point: ShaderProgram,
    pub directional: ShaderProgram,
}

/// Owner of every shadow map and of the passes that render them.
pub struct ShadowCaster<G: GpuResourceProvider> {
    gpu: Arc<G>,
    settings: ShadowSettings,
    point_pass: RenderPassHandle,
    directional_pass: RenderPassHandle,
    point_pipeline: GraphicsPipeline,
    directional_pipeline: GraphicsPipeline,
    cube_view_buffer: BufferHandle,
    cube_view_set: DescriptorSetHandle,
    sampling_layout: DescriptorLayoutDesc,
    sampling_set: DescriptorSetHandle,
    point_maps: Vec<PointShadowMap<G>>,
    directional_maps: Vec<DirectionalShadowMap<G>>,
    directional_states: Vec<ShadowMapState>,
    layouts_initialized: bool,
}

impl<G: GpuResourceProvider> ShadowCaster<G> {
    pub fn new(
        gpu: Arc<G>,
        capacity: LightCapacity,
        settings: ShadowSettings,
        shaders: &ShadowShaders,
    ) -> Result<Self> {
        info!(
            "[ShadowCaster] {} point maps @ {}, {} directional maps @ {}",
            capacity.point_shadows,
            settings.point_resolution,
            capacity.directional_shadows,
            settings.directional_resolution
        );

        let sampling_layout = Self::sampling_layout_for(&capacity);
        let mut caster = Self {
            gpu,
            settings,
            point_pass: RenderPassHandle::NULL,
            directional_pass: RenderPassHandle::NULL,
            point_pipeline: null_pipeline(),
            directional_pipeline: null_pipeline(),
            cube_view_buffer: BufferHandle::NULL,
            cube_view_set: DescriptorSetHandle::NULL,
            sampling_layout,
            sampling_set: DescriptorSetHandle::NULL,
            point_maps: Vec::with_capacity(usize::from(capacity.point_shadows)),
            directional_maps: Vec::with_capacity(usize::from(capacity.directional_shadows)),
            directional_states: vec![
                ShadowMapState::Unused;
                usize::from(capacity.directional_shadows)
            ],
            layouts_initialized: false,
        };

        caster.point_pass = caster.gpu.create_render_pass(&RenderPassDesc {
            label: "point_shadow",
            color: Some(AttachmentDesc {
                format: Format::R32Sfloat,
                final_layout: ImageLayout::ShaderReadOnly,
            }),
            depth: Some(AttachmentDesc {
                format: Format::D32Sfloat,
                final_layout: ImageLayout::DepthAttachment,
            }),
            multiview_mask: Some((1 << CUBE_FACES) - 1),
        })?;
        caster.directional_pass = caster.gpu.create_render_pass(&RenderPassDesc {
            label: "directional_shadow",
            color: None,
            depth: Some(AttachmentDesc {
                format: Format::D32Sfloat,
                final_layout: ImageLayout::DepthAttachment,
            }),
            multiview_mask: None,
        })?;

        let depth_bias = Some(DepthBias {
            constant: settings.depth_bias_constant,
            slope: settings.depth_bias_slope,
        });
        caster.point_pipeline = caster.gpu.create_pipeline(&PipelineDesc {
            label: "point_shadow",
            render_pass: caster.point_pass,
            program: shaders.point.clone(),
            set_layouts: vec![Self::cube_view_layout()],
            push_constant_size: MODEL_PUSH_SIZE + std::mem::size_of::<PointShadowPush>() as u32,
            cull: CullMode::Front,
            depth_bias,
            color_attachment: true,
        })?;
        caster.directional_pipeline = caster.gpu.create_pipeline(&PipelineDesc {
            label: "directional_shadow",
            render_pass: caster.directional_pass,
            program: shaders.directional.clone(),
            set_layouts: Vec::new(),
            push_constant_size: MODEL_PUSH_SIZE + std::mem::size_of::<[f32; 16]>() as u32,
            cull: CullMode::Front,
            depth_bias,
            color_attachment: false,
        })?;

        let cube_views = CubeFaceViews::new();
        caster.cube_view_buffer = caster.gpu.create_buffer(&BufferDesc {
            label: "cube_face_views",
            size: std::mem::size_of::<CubeFaceViews>() as u64,
            usage: BufferUsage::Uniform,
        })?;
        caster
            .gpu
            .write_buffer(caster.cube_view_buffer, 0, bytemuck::bytes_of(&cube_views))?;
        caster.cube_view_set = caster.gpu.create_descriptor_set(&DescriptorSetDesc {
            layout: Self::cube_view_layout(),
            writes: vec![DescriptorWrite::UniformBuffer {
                binding: 0,
                buffer: caster.cube_view_buffer,
                range: std::mem::size_of::<CubeFaceViews>() as u64,
            }],
        })?;

        for _ in 0..capacity.point_shadows {
            let map = PointShadowMap::new(
                caster.gpu.clone(),
                caster.point_pass,
                settings.point_resolution,
            )?;
            caster.point_maps.push(map);
        }
        for _ in 0..capacity.directional_shadows {
            let map = DirectionalShadowMap::new(
                caster.gpu.clone(),
                caster.directional_pass,
                settings.directional_resolution,
            )?;
            caster.directional_maps.push(map);
        }

        let mut writes = Vec::with_capacity(2);
        if !caster.point_maps.is_empty() {
            writes.push(DescriptorWrite::SampledImages {
                binding: 0,
                views: caster.point_maps.iter().map(|map| map.sample_view).collect(),
            });
        }
        if !caster.directional_maps.is_empty() {
            writes.push(DescriptorWrite::SampledImages {
                binding: 1,
                views: caster.directional_maps.iter().map(|map| map.sample_view).collect(),
            });
        }
        caster.sampling_set = caster.gpu.create_descriptor_set(&DescriptorSetDesc {
            layout: caster.sampling_layout.clone(),
            writes,
        })?;

        Ok(caster)
    }

    fn cube_view_layout() -> DescriptorLayoutDesc {
        DescriptorLayoutDesc {
            bindings: vec![BindingLayout {
                binding: 0,
                kind: BindingKind::UniformBuffer,
                count: 1,
                stages: ShaderStages::Vertex,
            }],
        }
    }

    fn sampling_layout_for(capacity: &LightCapacity) -> DescriptorLayoutDesc {
        DescriptorLayoutDesc {
            bindings: vec![
                BindingLayout {
                    binding: 0,
                    kind: BindingKind::SampledImage,
                    count: u32::from(capacity.point_shadows.max(1)),
                    stages: ShaderStages::Fragment,
                },
                BindingLayout {
                    binding: 1,
                    kind: BindingKind::SampledImage,
                    count: u32::from(capacity.directional_shadows.max(1)),
                    stages: ShaderStages::Fragment,
                },
            ],
        }
    }

    /// Layout of the set bound by [`Self::bind`], for building main-pass pipelines.
    pub fn sampling_layout(&self) -> &DescriptorLayoutDesc {
        &self.sampling_layout
    }

    pub fn settings(&self) -> &ShadowSettings {
        &self.settings
    }

    pub fn point_map_count(&self) -> usize {
        self.point_maps.len()
    }

    pub fn directional_map_count(&self) -> usize {
        self.directional_maps.len()
    }

    pub fn point_map(&self, slot: usize) -> Option<&PointShadowMap<G>> {
        self.point_maps.get(slot)
    }

    pub fn directional_map(&self, slot: usize) -> Option<&DirectionalShadowMap<G>> {
        self.directional_maps.get(slot)
    }

    pub fn directional_state(&self, slot: usize) -> Option<ShadowMapState> {
        self.directional_states.get(slot).copied()
    }

    pub fn point_pipeline(&self) -> PipelineHandle {
        self.point_pipeline.pipeline
    }

    pub fn directional_pipeline(&self) -> PipelineHandle {
        self.directional_pipeline.pipeline
    }

    /// Records every shadow pass for this frame. Lights without a slot are skipped.
    pub fn cast(
        &mut self,
        cmd: CommandBufferHandle,
        lights: &LightRegistry,
        drawables: &[&dyn Drawable],
    ) {
        let _timer = SectionTimer::new("shadow_cast");
        self.directional_states.fill(ShadowMapState::Unused);

        if !self.layouts_initialized {
            self.initialize_layouts(cmd);
        }

        let gpu = self.gpu.as_ref();
        let recorder: &dyn CommandRecorder = gpu;

        for (handle, light) in lights.point_lights() {
            let Some(slot) = light.shadow_slot else {
                continue;
            };
            let Some(map) = self.point_maps.get(slot.as_usize()) else {
                debug!("[ShadowCaster] point slot {} has no map", slot.0);
                continue;
            };
            let extent = map.extent();
            let layout = self.point_pipeline.layout;
            let push = PointShadowPush::new(light.position, light.radius);

            gpu.begin_render_pass(
                cmd,
                self.point_pass,
                map.framebuffer,
                extent,
                &[ClearValue::Color([1.0; 4]), ClearValue::Depth(1.0)],
            );
            gpu.bind_pipeline(cmd, self.point_pipeline.pipeline);
            gpu.set_viewport(cmd, Viewport::flipped(extent));
            gpu.set_scissor(cmd, extent);
            gpu.bind_descriptor_set(cmd, layout, 0, self.cube_view_set);
            gpu.push_constants(
                cmd,
                layout,
                ShaderStages::VertexFragment,
                MODEL_PUSH_SIZE,
                bytemuck::bytes_of(&push),
            );
            for drawable in drawables {
                drawable.draw_geometry(recorder, cmd, layout);
            }
            gpu.end_render_pass(cmd);
            debug!("[ShadowCaster] cube shadow for {:?}", handle);
        }

        for (_, light) in lights.directional_lights() {
            let Some(slot) = light.shadow_slot else {
                continue;
            };
            let Some(map) = self.directional_maps.get(slot.as_usize()) else {
                debug!("[ShadowCaster] directional slot {} has no map", slot.0);
                continue;
            };
            let extent = map.extent();
            let layout = self.directional_pipeline.layout;
            let cascades = (light.num_cascades as usize).clamp(1, MAX_CASCADES);

            for (cascade, framebuffer) in map.framebuffers.iter().enumerate().take(cascades) {
                gpu.begin_render_pass(
                    cmd,
                    self.directional_pass,
                    *framebuffer,
                    extent,
                    &[ClearValue::Depth(1.0)],
                );
                gpu.bind_pipeline(cmd, self.directional_pipeline.pipeline);
                gpu.set_viewport(cmd, Viewport::flipped(extent));
                gpu.set_scissor(cmd, extent);
                gpu.push_constants(
                    cmd,
                    layout,
                    ShaderStages::Vertex,
                    MODEL_PUSH_SIZE,
                    bytemuck::bytes_of(&light.cascade_view_proj[cascade].to_cols_array()),
                );
                for drawable in drawables {
                    drawable.draw_geometry(recorder, cmd, layout);
                }
                gpu.end_render_pass(cmd);
            }
            self.directional_states[slot.as_usize()] = ShadowMapState::Written;

            // Layers past the active cascades were left readable by earlier frames.
            gpu.transition_image(
                cmd,
                ImageTransition {
                    image: map.image,
                    from: ImageLayout::DepthAttachment,
                    to: ImageLayout::ShaderReadOnly,
                    base_layer: 0,
                    layer_count: cascades as u32,
                    depth: true,
                },
            );
            self.directional_states[slot.as_usize()] = ShadowMapState::Readable;
        }
    }

    /// First use: move every sampled image into the read-only layout so slots that
    /// are never rendered are still valid to bind.
    fn initialize_layouts(&mut self, cmd: CommandBufferHandle) {
        for map in &self.point_maps {
            self.gpu.transition_image(
                cmd,
                ImageTransition {
                    image: map.color_image,
                    from: ImageLayout::Undefined,
                    to: ImageLayout::ShaderReadOnly,
                    base_layer: 0,
                    layer_count: CUBE_FACES,
                    depth: false,
                },
            );
        }
        for map in &self.directional_maps {
            self.gpu.transition_image(
                cmd,
                ImageTransition {
                    image: map.image,
                    from: ImageLayout::Undefined,
                    to: ImageLayout::ShaderReadOnly,
                    base_layer: 0,
                    layer_count: MAX_CASCADES as u32,
                    depth: true,
                },
            );
        }
        self.layouts_initialized = true;
    }

    /// Binds the shadow sampling set for the main pass.
    pub fn bind(&self, cmd: CommandBufferHandle, layout: PipelineLayoutHandle, set_index: u32) {
        debug_assert!(
            !self.directional_states.contains(&ShadowMapState::Written),
            "directional shadow map left in attachment layout"
        );
        self.gpu
            .bind_descriptor_set(cmd, layout, set_index, self.sampling_set);
    }
}

fn null_pipeline() -> GraphicsPipeline {
    GraphicsPipeline {
        pipeline: PipelineHandle::NULL,
        layout: PipelineLayoutHandle::NULL,
    }
}

impl<G: GpuResourceProvider> Drop for ShadowCaster<G> {
    fn drop(&mut self) {
        // Framebuffers reference the passes, so maps go first.
        self.directional_maps.clear();
        self.point_maps.clear();

        if !self.sampling_set.is_null() {
            self.gpu.destroy_descriptor_set(self.sampling_set);
        }
        if !self.cube_view_set.is_null() {
            self.gpu.destroy_descriptor_set(self.cube_view_set);
        }
        if !self.cube_view_buffer.is_null() {
            self.gpu.destroy_buffer(self.cube_view_buffer);
        }
        for pipeline in [self.directional_pipeline, self.point_pipeline] {
            if !pipeline.pipeline.is_null() {
                self.gpu.destroy_pipeline(pipeline);
            }
        }
        for pass in [self.directional_pass, self.point_pass] {
            if !pass.is_null() {
                self.gpu.destroy_render_pass(pass);
            }
        }
        info!("[ShadowCaster] destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn point_push_matches_perspective_depth_terms() {
        let push = PointShadowPush::new(Vec3::ONE, 10.0);
        let reference = Mat4::perspective_rh(90.0_f32.to_radians(), 1.0, POINT_SHADOW_NEAR, 10.0);
        assert_relative_eq!(push.p22, reference.z_axis.z, epsilon = 1e-5);
        assert_relative_eq!(push.p32, reference.w_axis.z, epsilon = 1e-5);
        assert_eq!(std::mem::size_of::<PointShadowPush>(), 24);
    }

    #[test]
    fn small_point_radius_keeps_depth_terms_finite() {
        let push = PointShadowPush::new(Vec3::ZERO, POINT_SHADOW_NEAR + 0.01);
        assert!(push.p22.is_finite() && push.p22 < 0.0);
        assert!(push.p32.is_finite() && push.p32 < 0.0);
    }

    #[test]
    fn cube_faces_look_along_each_axis() {
        let views = CubeFaceViews::new();
        let to_world = Mat4::from_cols_array(&views.views[0]).inverse();
        let forward = to_world * Vec4::new(0.0, 0.0, -1.0, 0.0);
        assert_relative_eq!(forward.x, 1.0, epsilon = 1e-6);
    }
}
