//! GPU resources backing one shadow slot.

use std::sync::Arc;

use log::debug;

use crate::config::{CUBE_FACES, MAX_CASCADES};
use crate::error::Result;
use crate::gpu::{
    Extent2D, Format, FramebufferDesc, FramebufferHandle, GpuResourceProvider, ImageDesc,
    ImageHandle, ImageKind, ImageUsage, ImageViewDesc, ImageViewHandle, RenderPassHandle, ViewKind,
};

/// Cube shadow for a point light: an R32 distance cube plus a D32 depth cube,
/// rendered in a single multiview pass.
pub struct PointShadowMap<G: GpuResourceProvider> {
    gpu: Arc<G>,
    pub resolution: u32,
    pub color_image: ImageHandle,
    pub depth_image: ImageHandle,
    color_attachment_view: ImageViewHandle,
    depth_attachment_view: ImageViewHandle,
    /// Cube view of the distance image used for sampling.
    pub sample_view: ImageViewHandle,
    pub framebuffer: FramebufferHandle,
}

impl<G: GpuResourceProvider> PointShadowMap<G> {
    pub fn new(gpu: Arc<G>, render_pass: RenderPassHandle, resolution: u32) -> Result<Self> {
        let mut map = Self {
            gpu,
            resolution,
            color_image: ImageHandle::NULL,
            depth_image: ImageHandle::NULL,
            color_attachment_view: ImageViewHandle::NULL,
            depth_attachment_view: ImageViewHandle::NULL,
            sample_view: ImageViewHandle::NULL,
            framebuffer: FramebufferHandle::NULL,
        };
        let extent = Extent2D::square(resolution);
        let all_faces = ViewKind::Array {
            base_layer: 0,
            layers: CUBE_FACES,
        };

        map.color_image = map.gpu.create_image(&ImageDesc {
            label: "point_shadow_distance",
            extent,
            kind: ImageKind::Cube,
            format: Format::R32Sfloat,
            usage: ImageUsage::SAMPLED_COLOR,
        })?;
        map.depth_image = map.gpu.create_image(&ImageDesc {
            label: "point_shadow_depth",
            extent,
            kind: ImageKind::Cube,
            format: Format::D32Sfloat,
            usage: ImageUsage::DEPTH,
        })?;
        map.color_attachment_view = map.gpu.create_image_view(&ImageViewDesc {
            image: map.color_image,
            format: Format::R32Sfloat,
            kind: all_faces,
        })?;
        map.depth_attachment_view = map.gpu.create_image_view(&ImageViewDesc {
            image: map.depth_image,
            format: Format::D32Sfloat,
            kind: all_faces,
        })?;
        map.sample_view = map.gpu.create_image_view(&ImageViewDesc {
            image: map.color_image,
            format: Format::R32Sfloat,
            kind: ViewKind::Cube,
        })?;
        // Multiview broadcasts to the six layers, so the framebuffer itself has one.
        map.framebuffer = map.gpu.create_framebuffer(&FramebufferDesc {
            render_pass,
            attachments: vec![map.color_attachment_view, map.depth_attachment_view],
            extent,
            layers: 1,
        })?;

        Ok(map)
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D::square(self.resolution)
    }
}

impl<G: GpuResourceProvider> Drop for PointShadowMap<G> {
    fn drop(&mut self) {
        if !self.framebuffer.is_null() {
            self.gpu.destroy_framebuffer(self.framebuffer);
        }
        for view in [
            self.sample_view,
            self.depth_attachment_view,
            self.color_attachment_view,
        ] {
            if !view.is_null() {
                self.gpu.destroy_image_view(view);
            }
        }
        for image in [self.depth_image, self.color_image] {
            if !image.is_null() {
                self.gpu.destroy_image(image);
            }
        }
        debug!("[PointShadowMap] destroyed");
    }
}

/// Layered depth image with one layer and framebuffer per cascade.
pub struct DirectionalShadowMap<G: GpuResourceProvider> {
    gpu: Arc<G>,
    pub resolution: u32,
    pub image: ImageHandle,
    /// Array view over every cascade layer used for sampling.
    pub sample_view: ImageViewHandle,
    layer_views: Vec<ImageViewHandle>,
    pub framebuffers: Vec<FramebufferHandle>,
}

impl<G: GpuResourceProvider> DirectionalShadowMap<G> {
    pub fn new(gpu: Arc<G>, render_pass: RenderPassHandle, resolution: u32) -> Result<Self> {
        let mut map = Self {
            gpu,
            resolution,
            image: ImageHandle::NULL,
            sample_view: ImageViewHandle::NULL,
            layer_views: Vec::with_capacity(MAX_CASCADES),
            framebuffers: Vec::with_capacity(MAX_CASCADES),
        };
        let extent = Extent2D::square(resolution);

        map.image = map.gpu.create_image(&ImageDesc {
            label: "directional_shadow_cascades",
            extent,
            kind: ImageKind::Layered {
                layers: MAX_CASCADES as u32,
            },
            format: Format::D32Sfloat,
            usage: ImageUsage::SAMPLED_DEPTH,
        })?;
        map.sample_view = map.gpu.create_image_view(&ImageViewDesc {
            image: map.image,
            format: Format::D32Sfloat,
            kind: ViewKind::Array {
                base_layer: 0,
                layers: MAX_CASCADES as u32,
            },
        })?;

        for layer in 0..MAX_CASCADES as u32 {
            let view = map.gpu.create_image_view(&ImageViewDesc {
                image: map.image,
                format: Format::D32Sfloat,
                kind: ViewKind::Single { layer },
            })?;
            map.layer_views.push(view);
            let framebuffer = map.gpu.create_framebuffer(&FramebufferDesc {
                render_pass,
                attachments: vec![view],
                extent,
                layers: 1,
            })?;
            map.framebuffers.push(framebuffer);
        }

        Ok(map)
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D::square(self.resolution)
    }
}

impl<G: GpuResourceProvider> Drop for DirectionalShadowMap<G> {
    fn drop(&mut self) {
        for framebuffer in self.framebuffers.drain(..).rev() {
            self.gpu.destroy_framebuffer(framebuffer);
        }
        for view in self.layer_views.drain(..).rev() {
            self.gpu.destroy_image_view(view);
        }
        if !self.sample_view.is_null() {
            self.gpu.destroy_image_view(self.sample_view);
        }
        if !self.image.is_null() {
            self.gpu.destroy_image(self.image);
        }
        debug!("[DirectionalShadowMap] destroyed");
    }
}
