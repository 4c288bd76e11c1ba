//! GPU-ready light arrays and the per-image uniform buffers that hold them.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::info;

use super::registry::{DirectionalLightRecord, LightRegistry, PointLightRecord};
use crate::config::MAX_CASCADES;
use crate::error::Result;
use crate::gpu::{BufferDesc, BufferHandle, BufferUsage, GpuResourceProvider};

/// Point light as laid out in the lighting shader (std140 compatible).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuPointLight {
    pub position: [f32; 3],
    pub brightness: f32,
    pub radius: f32,
    /// Shadow slot index, or -1 when the light casts no shadow.
    pub shadow_index: i32,
    pub _padding: [f32; 2],
}

impl GpuPointLight {
    /// Entry for a free slot; zero brightness with no shadow.
    pub const EMPTY: Self = Self {
        position: [0.0; 3],
        brightness: 0.0,
        radius: 0.0,
        shadow_index: -1,
        _padding: [0.0; 2],
    };
}

impl From<&PointLightRecord> for GpuPointLight {
    fn from(record: &PointLightRecord) -> Self {
        Self {
            position: record.position.to_array(),
            brightness: record.brightness,
            radius: record.radius,
            shadow_index: record.shadow_slot.map_or(-1, |slot| i32::from(slot.0)),
            _padding: [0.0; 2],
        }
    }
}

/// Directional light with its cascade data (std140 compatible).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuDirectionalLight {
    pub direction: [f32; 3],
    pub brightness: f32,
    pub num_cascades: u32,
    pub shadow_index: i32,
    pub _padding: [u32; 2],
    pub cascade_splits: [f32; 4],
    pub cascade_view_proj: [[f32; 16]; MAX_CASCADES],
}

impl GpuDirectionalLight {
    pub const EMPTY: Self = Self {
        direction: [0.0; 3],
        brightness: 0.0,
        num_cascades: 0,
        shadow_index: -1,
        _padding: [0; 2],
        cascade_splits: [0.0; 4],
        cascade_view_proj: [[0.0; 16]; MAX_CASCADES],
    };
}

impl From<&DirectionalLightRecord> for GpuDirectionalLight {
    fn from(record: &DirectionalLightRecord) -> Self {
        Self {
            direction: record.direction.to_array(),
            brightness: record.brightness,
            num_cascades: record.num_cascades,
            shadow_index: record.shadow_slot.map_or(-1, |slot| i32::from(slot.0)),
            _padding: [0; 2],
            cascade_splits: record.cascade_splits.to_array(),
            cascade_view_proj: record.cascade_view_proj.map(|m| m.to_cols_array()),
        }
    }
}

/// Point light array indexed by slot, one entry per pool slot.
pub fn pack_point_lights(registry: &LightRegistry) -> Vec<GpuPointLight> {
    registry
        .point_slots()
        .map(|slot| slot.map_or(GpuPointLight::EMPTY, GpuPointLight::from))
        .collect()
}

/// Directional light array indexed by slot, one entry per pool slot.
pub fn pack_directional_lights(registry: &LightRegistry) -> Vec<GpuDirectionalLight> {
    registry
        .directional_slots()
        .map(|slot| slot.map_or(GpuDirectionalLight::EMPTY, GpuDirectionalLight::from))
        .collect()
}

/// Light uniform buffers for one swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightBuffers {
    pub point: BufferHandle,
    pub directional: BufferHandle,
}

/// One pair of light buffers per swapchain image, so the CPU never writes a buffer
/// the GPU may still be reading.
pub struct LightUniforms<G: GpuResourceProvider> {
    gpu: Arc<G>,
    point_size: u64,
    directional_size: u64,
    buffers: Vec<LightBuffers>,
}

impl<G: GpuResourceProvider> LightUniforms<G> {
    pub fn new(gpu: Arc<G>, registry: &LightRegistry, image_count: u32) -> Result<Self> {
        let point_size = (std::mem::size_of::<GpuPointLight>()
            * usize::from(registry.max_point_lights().max(1))) as u64;
        let directional_size = (std::mem::size_of::<GpuDirectionalLight>()
            * usize::from(registry.max_directional_lights().max(1))) as u64;

        let mut uniforms = Self {
            gpu,
            point_size,
            directional_size,
            buffers: Vec::new(),
        };
        uniforms.rebuild(image_count)?;
        Ok(uniforms)
    }

    /// Recreates the per-image buffers for a new swapchain image count.
    pub fn rebuild(&mut self, image_count: u32) -> Result<()> {
        self.release();
        for _ in 0..image_count {
            let point = self.gpu.create_buffer(&BufferDesc {
                label: "point_lights",
                size: self.point_size,
                usage: BufferUsage::Uniform,
            })?;
            let directional = match self.gpu.create_buffer(&BufferDesc {
                label: "directional_lights",
                size: self.directional_size,
                usage: BufferUsage::Uniform,
            }) {
                Ok(buffer) => buffer,
                Err(err) => {
                    self.gpu.destroy_buffer(point);
                    return Err(err);
                }
            };
            self.buffers.push(LightBuffers { point, directional });
        }
        info!("[LightUniforms] {} light buffer pairs", self.buffers.len());
        Ok(())
    }

    /// Writes the current light arrays into the buffers of `image_index`.
    pub fn upload(&self, image_index: u32, registry: &LightRegistry) -> Result<()> {
        let Some(buffers) = self.buffers.get(image_index as usize) else {
            return Err(crate::RenderError::UnknownHandle(format!(
                "no light buffers for image {image_index}"
            )));
        };
        let points = pack_point_lights(registry);
        let directionals = pack_directional_lights(registry);
        self.gpu
            .write_buffer(buffers.point, 0, bytemuck::cast_slice(&points))?;
        self.gpu
            .write_buffer(buffers.directional, 0, bytemuck::cast_slice(&directionals))?;
        Ok(())
    }

    pub fn buffers(&self, image_index: u32) -> Option<LightBuffers> {
        self.buffers.get(image_index as usize).copied()
    }

    pub fn point_buffer_size(&self) -> u64 {
        self.point_size
    }

    pub fn directional_buffer_size(&self) -> u64 {
        self.directional_size
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn release(&mut self) {
        while let Some(buffers) = self.buffers.pop() {
            self.gpu.destroy_buffer(buffers.directional);
            self.gpu.destroy_buffer(buffers.point);
        }
    }
}

impl<G: GpuResourceProvider> Drop for LightUniforms<G> {
    fn drop(&mut self) {
        self.release();
    }
}
