//! GPU resource abstraction.
//!
//! The renderer core never talks to a graphics API directly. Everything it needs
//! from the device goes through [`GpuResourceProvider`], with command recording
//! split out into [`CommandRecorder`] so that geometry callbacks only see the
//! recording half. Objects are referred to by small `Copy` handles owned by the
//! provider.
//!
//! Two providers ship with the crate: [`AshBackend`] on top of a caller-created
//! Vulkan device, and [`RecordingBackend`], an in-memory provider that logs every
//! call and is used by tests and the headless demo.

pub mod ash_backend;
pub mod recording;

pub use ash_backend::{AshBackend, AshContext};
pub use recording::{GpuCall, RecordingBackend, ResourceKind};

use std::time::Duration;

use crate::error::Result;

macro_rules! gpu_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }
        )*
    };
}

gpu_handle!(
    ImageHandle,
    ImageViewHandle,
    BufferHandle,
    RenderPassHandle,
    FramebufferHandle,
    PipelineHandle,
    PipelineLayoutHandle,
    DescriptorSetHandle,
    SemaphoreHandle,
    FenceHandle,
    CommandBufferHandle,
    SwapchainHandle,
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn square(size: u32) -> Self {
        Self::new(size, size)
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R32Sfloat,
    D32Sfloat,
    Bgra8Srgb,
    Rgba8Unorm,
    Rgba16Sfloat,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Self::D32Sfloat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Flat,
    Layered { layers: u32 },
    Cube,
}

impl ImageKind {
    pub fn layer_count(self) -> u32 {
        match self {
            Self::Flat => 1,
            Self::Layered { layers } => layers,
            Self::Cube => crate::config::CUBE_FACES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageUsage {
    pub color_attachment: bool,
    pub depth_attachment: bool,
    pub sampled: bool,
}

impl ImageUsage {
    pub const SAMPLED_COLOR: Self = Self {
        color_attachment: true,
        depth_attachment: false,
        sampled: true,
    };
    pub const SAMPLED_DEPTH: Self = Self {
        color_attachment: false,
        depth_attachment: true,
        sampled: true,
    };
    pub const DEPTH: Self = Self {
        color_attachment: false,
        depth_attachment: true,
        sampled: false,
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDesc {
    pub label: &'static str,
    pub extent: Extent2D,
    pub kind: ImageKind,
    pub format: Format,
    pub usage: ImageUsage,
}

/// Which part of an image a view exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Single { layer: u32 },
    Array { base_layer: u32, layers: u32 },
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewDesc {
    pub image: ImageHandle,
    pub format: Format,
    pub kind: ViewKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Uniform,
    Storage,
    Vertex,
    Index,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: Format,
    pub final_layout: ImageLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDesc {
    pub label: &'static str,
    pub color: Option<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
    /// Broadcast the subpass to every view whose bit is set.
    pub multiview_mask: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferDesc {
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageViewHandle>,
    pub extent: Extent2D,
    pub layers: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStages {
    Vertex,
    Fragment,
    VertexFragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    SampledImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingLayout {
    pub binding: u32,
    pub kind: BindingKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Layout of a descriptor set, shared between pipelines and the sets they bind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DescriptorLayoutDesc {
    pub bindings: Vec<BindingLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorWrite {
    UniformBuffer {
        binding: u32,
        buffer: BufferHandle,
        range: u64,
    },
    SampledImages {
        binding: u32,
        views: Vec<ImageViewHandle>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSetDesc {
    pub layout: DescriptorLayoutDesc,
    pub writes: Vec<DescriptorWrite>,
}

/// Opaque compiled shader code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderProgram {
    pub vertex: Vec<u32>,
    pub fragment: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub slope: f32,
}

/// Graphics pipeline with dynamic viewport and scissor.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub label: &'static str,
    pub render_pass: RenderPassHandle,
    pub program: ShaderProgram,
    pub set_layouts: Vec<DescriptorLayoutDesc>,
    pub push_constant_size: u32,
    pub cull: CullMode,
    pub depth_bias: Option<DepthBias>,
    pub color_attachment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphicsPipeline {
    pub pipeline: PipelineHandle,
    pub layout: PipelineLayoutHandle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport flipped vertically so +Y points up in clip space.
    pub fn flipped(extent: Extent2D) -> Self {
        Self {
            x: 0.0,
            y: extent.height as f32,
            width: extent.width as f32,
            height: -(extent.height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageTransition {
    pub image: ImageHandle,
    pub from: ImageLayout,
    pub to: ImageLayout,
    pub base_layer: u32,
    pub layer_count: u32,
    pub depth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmitDesc {
    pub command_buffer: CommandBufferHandle,
    /// Waited on at the colour-attachment-output stage.
    pub wait: Option<SemaphoreHandle>,
    pub signal: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainDesc {
    pub extent: Extent2D,
    pub min_image_count: u32,
    pub old: Option<SwapchainHandle>,
}

/// A live swapchain and the per-image views the provider created for it.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainInfo {
    pub handle: SwapchainHandle,
    pub extent: Extent2D,
    pub format: Format,
    pub images: Vec<ImageHandle>,
    pub image_views: Vec<ImageViewHandle>,
}

impl SwapchainInfo {
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Command recording half of the provider.
///
/// Recording is infallible at this level; providers log and drop malformed commands.
pub trait CommandRecorder {
    fn begin_render_pass(
        &self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear: &[ClearValue],
    );

    fn end_render_pass(&self, cmd: CommandBufferHandle);

    fn bind_pipeline(&self, cmd: CommandBufferHandle, pipeline: PipelineHandle);

    fn bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    );

    fn bind_vertex_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64);

    fn bind_index_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64);

    fn push_constants(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    );

    fn set_viewport(&self, cmd: CommandBufferHandle, viewport: Viewport);

    fn set_scissor(&self, cmd: CommandBufferHandle, extent: Extent2D);

    fn draw_indexed(
        &self,
        cmd: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn transition_image(&self, cmd: CommandBufferHandle, transition: ImageTransition);
}

/// Everything the renderer core needs from a GPU device.
///
/// Destruction is infallible so it can run from `Drop`.
pub trait GpuResourceProvider: CommandRecorder {
    fn name(&self) -> &str;

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageViewHandle>;
    fn destroy_image_view(&self, view: ImageViewHandle);

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle>;
    fn destroy_render_pass(&self, render_pass: RenderPassHandle);

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferHandle>;
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<GraphicsPipeline>;
    fn destroy_pipeline(&self, pipeline: GraphicsPipeline);

    fn create_descriptor_set(&self, desc: &DescriptorSetDesc) -> Result<DescriptorSetHandle>;
    fn destroy_descriptor_set(&self, set: DescriptorSetHandle);

    fn create_semaphore(&self) -> Result<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<FenceStatus>;
    fn reset_fence(&self, fence: FenceHandle) -> Result<()>;

    fn allocate_command_buffer(&self) -> Result<CommandBufferHandle>;
    fn free_command_buffer(&self, cmd: CommandBufferHandle);
    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;
    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;
    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()>;

    fn submit(&self, desc: &SubmitDesc) -> Result<()>;

    /// Current drawable size of the surface; zero while minimised.
    fn surface_extent(&self) -> Extent2D;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainInfo>;
    fn destroy_swapchain(&self, swapchain: SwapchainHandle);

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> Result<AcquireOutcome>;

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> Result<PresentOutcome>;

    fn wait_idle(&self) -> Result<()>;
}
