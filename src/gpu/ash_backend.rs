//! Vulkan provider built on `ash` and `vk-mem`.
//!
//! The caller owns instance, device and surface creation and hands them over in an
//! [`AshContext`]. The backend keeps every object it creates in a handle table so
//! the renderer core only ever sees plain integer handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ash::{khr, vk};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use vk_mem::Alloc;

use super::{
    AcquireOutcome, BindingKind, BufferDesc, BufferHandle, BufferUsage, ClearValue,
    CommandBufferHandle, CommandRecorder, CullMode, DescriptorLayoutDesc, DescriptorSetDesc,
    DescriptorSetHandle, DescriptorWrite, Extent2D, FenceHandle, FenceStatus, Format,
    FramebufferDesc, FramebufferHandle, GpuResourceProvider, GraphicsPipeline, ImageDesc,
    ImageHandle, ImageKind, ImageLayout, ImageTransition, ImageViewDesc, ImageViewHandle,
    PipelineDesc, PipelineHandle, PipelineLayoutHandle, PresentOutcome, RenderPassDesc,
    RenderPassHandle, SemaphoreHandle, ShaderStages, SubmitDesc, SwapchainDesc, SwapchainHandle,
    SwapchainInfo, ViewKind, Viewport,
};
use crate::error::{RenderError, Result};

const MAX_DESCRIPTOR_SETS: u32 = 64;
const MAX_UNIFORM_DESCRIPTORS: u32 = 64;
const MAX_SAMPLER_DESCRIPTORS: u32 = 256;

/// Device objects created by the application and lent to the backend.
///
/// The backend never destroys anything in here; the caller must keep the instance,
/// device and surface alive until the backend is dropped.
pub struct AshContext {
    pub instance: ash::Instance,
    pub device: Arc<ash::Device>,
    pub physical_device: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::surface::Instance,
    /// Stride of the vertex buffers bound by drawables. Position is read as three
    /// floats at offset 0 of binding 0.
    pub vertex_stride: u32,
    /// Surface size to use when the platform leaves it up to the swapchain.
    pub window_extent: Extent2D,
}

enum Object {
    Image {
        image: vk::Image,
        // None for swapchain images, which the presentation engine owns.
        allocation: Option<vk_mem::Allocation>,
    },
    ImageView(vk::ImageView),
    Buffer {
        buffer: vk::Buffer,
        allocation: vk_mem::Allocation,
        size: u64,
    },
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Pipeline {
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        push_stages: vk::ShaderStageFlags,
    },
    DescriptorSet(vk::DescriptorSet),
    Semaphore(vk::Semaphore),
    Fence(vk::Fence),
    CommandBuffer(vk::CommandBuffer),
    Swapchain {
        swapchain: vk::SwapchainKHR,
        images: Vec<u64>,
        views: Vec<u64>,
    },
}

#[derive(Default)]
struct HandleTable {
    next_id: u64,
    objects: HashMap<u64, Object>,
    set_layouts: HashMap<DescriptorLayoutDesc, vk::DescriptorSetLayout>,
}

impl HandleTable {
    fn insert(&mut self, object: Object) -> u64 {
        self.next_id += 1;
        self.objects.insert(self.next_id, object);
        self.next_id
    }
}

/// [`GpuResourceProvider`] over a real Vulkan device.
pub struct AshBackend {
    table: Mutex<HandleTable>,
    window_extent: Mutex<Extent2D>,
    swapchain_loader: khr::swapchain::Device,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    sampler: vk::Sampler,
    // Declared before `ctx` so it is destroyed while the device is still alive.
    allocator: vk_mem::Allocator,
    ctx: AshContext,
}

impl AshBackend {
    /// Creates the allocator, command pool, descriptor pool and shadow sampler.
    pub fn new(ctx: AshContext) -> Result<Self> {
        let allocator = unsafe {
            vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
                &ctx.instance,
                &ctx.device,
                ctx.physical_device,
            ))
        }
        .map_err(|e| RenderError::VulkanError(format!("VMA init failed: {e:?}")))?;

        let swapchain_loader = khr::swapchain::Device::new(&ctx.instance, &ctx.device);

        let command_pool = unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(ctx.queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            ctx.device
                .create_command_pool(&pool_info, None)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to create command pool: {e}"))
                })?
        };

        let descriptor_pool = unsafe {
            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: MAX_UNIFORM_DESCRIPTORS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: MAX_SAMPLER_DESCRIPTORS,
                },
            ];
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                .pool_sizes(&pool_sizes)
                .max_sets(MAX_DESCRIPTOR_SETS);
            match ctx.device.create_descriptor_pool(&pool_info, None) {
                Ok(pool) => pool,
                Err(e) => {
                    ctx.device.destroy_command_pool(command_pool, None);
                    return Err(RenderError::VulkanError(format!(
                        "Failed to create descriptor pool: {e}"
                    )));
                }
            }
        };

        let sampler = unsafe {
            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .max_lod(1.0);
            match ctx.device.create_sampler(&sampler_info, None) {
                Ok(sampler) => sampler,
                Err(e) => {
                    ctx.device.destroy_descriptor_pool(descriptor_pool, None);
                    ctx.device.destroy_command_pool(command_pool, None);
                    return Err(RenderError::VulkanError(format!(
                        "Failed to create shadow sampler: {e}"
                    )));
                }
            }
        };

        info!("[AshBackend] initialised on queue family {}", ctx.queue_family);

        Ok(Self {
            table: Mutex::new(HandleTable::default()),
            window_extent: Mutex::new(ctx.window_extent),
            swapchain_loader,
            command_pool,
            descriptor_pool,
            sampler,
            allocator,
            ctx,
        })
    }

    pub fn context(&self) -> &AshContext {
        &self.ctx
    }

    /// Updates the fallback surface size, e.g. from a window resize event.
    pub fn set_window_extent(&self, extent: Extent2D) {
        *self.window_extent.lock() = extent;
    }

    fn device(&self) -> &ash::Device {
        &self.ctx.device
    }

    fn unknown(kind: &str, id: u64) -> RenderError {
        RenderError::UnknownHandle(format!("{kind} {id}"))
    }

    fn image(&self, handle: ImageHandle) -> Result<vk::Image> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::Image { image, .. }) => Ok(*image),
            _ => Err(Self::unknown("image", handle.0)),
        }
    }

    fn image_view(&self, handle: ImageViewHandle) -> Option<vk::ImageView> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::ImageView(view)) => Some(*view),
            _ => None,
        }
    }

    fn buffer(&self, handle: BufferHandle) -> Option<vk::Buffer> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::Buffer { buffer, .. }) => Some(*buffer),
            _ => None,
        }
    }

    fn render_pass(&self, handle: RenderPassHandle) -> Option<vk::RenderPass> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::RenderPass(pass)) => Some(*pass),
            _ => None,
        }
    }

    fn framebuffer(&self, handle: FramebufferHandle) -> Option<vk::Framebuffer> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::Framebuffer(fb)) => Some(*fb),
            _ => None,
        }
    }

    fn pipeline(
        &self,
        id: u64,
    ) -> Option<(vk::Pipeline, vk::PipelineLayout, vk::ShaderStageFlags)> {
        match self.table.lock().objects.get(&id) {
            Some(Object::Pipeline {
                pipeline,
                layout,
                push_stages,
            }) => Some((*pipeline, *layout, *push_stages)),
            _ => None,
        }
    }

    fn descriptor_set(&self, handle: DescriptorSetHandle) -> Option<vk::DescriptorSet> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::DescriptorSet(set)) => Some(*set),
            _ => None,
        }
    }

    fn semaphore(&self, handle: SemaphoreHandle) -> Result<vk::Semaphore> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::Semaphore(sem)) => Ok(*sem),
            _ => Err(Self::unknown("semaphore", handle.0)),
        }
    }

    fn fence(&self, handle: FenceHandle) -> Result<vk::Fence> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::Fence(fence)) => Ok(*fence),
            _ => Err(Self::unknown("fence", handle.0)),
        }
    }

    fn command_buffer(&self, handle: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::CommandBuffer(cmd)) => Some(*cmd),
            _ => None,
        }
    }

    fn swapchain(&self, handle: SwapchainHandle) -> Result<vk::SwapchainKHR> {
        match self.table.lock().objects.get(&handle.0) {
            Some(Object::Swapchain { swapchain, .. }) => Ok(*swapchain),
            _ => Err(Self::unknown("swapchain", handle.0)),
        }
    }

    fn recording_cmd(&self, cmd: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        let resolved = self.command_buffer(cmd);
        if resolved.is_none() {
            warn!("[AshBackend] dropping command for unknown command buffer {}", cmd.0);
        }
        resolved
    }

    fn set_layout(&self, desc: &DescriptorLayoutDesc) -> Result<vk::DescriptorSetLayout> {
        let mut table = self.table.lock();
        if let Some(layout) = table.set_layouts.get(desc) {
            return Ok(*layout);
        }

        let bindings: Vec<_> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(descriptor_type(b.kind))
                    .descriptor_count(b.count)
                    .stage_flags(stage_flags(b.stages))
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe {
            self.device()
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to create descriptor set layout: {e}"))
                })?
        };
        table.set_layouts.insert(desc.clone(), layout);
        Ok(layout)
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RenderError::ResourceCreationFailed(
                "empty shader module".to_string(),
            ));
        }
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe {
            self.device()
                .create_shader_module(&create_info, None)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to create shader module: {e}"))
                })
        }
    }

    fn destroy_object(&self, object: Object) {
        let device = self.device();
        unsafe {
            match object {
                Object::Image {
                    image,
                    allocation: Some(mut allocation),
                } => self.allocator.destroy_image(image, &mut allocation),
                Object::Image {
                    allocation: None, ..
                } => {}
                Object::ImageView(view) => device.destroy_image_view(view, None),
                Object::Buffer {
                    buffer,
                    mut allocation,
                    ..
                } => self.allocator.destroy_buffer(buffer, &mut allocation),
                Object::RenderPass(pass) => device.destroy_render_pass(pass, None),
                Object::Framebuffer(fb) => device.destroy_framebuffer(fb, None),
                Object::Pipeline {
                    pipeline, layout, ..
                } => {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(layout, None);
                }
                Object::DescriptorSet(set) => {
                    if let Err(e) = device.free_descriptor_sets(self.descriptor_pool, &[set]) {
                        error!("[AshBackend] failed to free descriptor set: {e}");
                    }
                }
                Object::Semaphore(sem) => device.destroy_semaphore(sem, None),
                Object::Fence(fence) => device.destroy_fence(fence, None),
                Object::CommandBuffer(cmd) => {
                    device.free_command_buffers(self.command_pool, &[cmd])
                }
                Object::Swapchain { swapchain, .. } => {
                    self.swapchain_loader.destroy_swapchain(swapchain, None)
                }
            }
        }
    }

    fn release(&self, id: u64) {
        let object = self.table.lock().objects.remove(&id);
        match object {
            Some(object) => self.destroy_object(object),
            None => warn!("[AshBackend] destroy of unknown handle {id}"),
        }
    }

    fn pick_surface_format(&self) -> Result<(vk::SurfaceFormatKHR, Format)> {
        let formats = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_formats(self.ctx.physical_device, self.ctx.surface)
                .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?
        };

        let find = |wanted: vk::Format| {
            formats.iter().copied().find(|f| {
                f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        };
        if let Some(format) = find(vk::Format::B8G8R8A8_SRGB) {
            return Ok((format, Format::Bgra8Srgb));
        }
        if let Some(format) = find(vk::Format::R8G8B8A8_UNORM) {
            return Ok((format, Format::Rgba8Unorm));
        }
        Err(RenderError::SwapchainCreationFailed(
            "no supported surface format".to_string(),
        ))
    }
}

impl Drop for AshBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.device.device_wait_idle() {
                error!("[AshBackend] device_wait_idle failed during teardown: {e}");
            }
        }

        let (objects, layouts) = {
            let mut table = self.table.lock();
            let objects: Vec<_> = table.objects.drain().collect();
            let layouts: Vec<_> = table.set_layouts.drain().map(|(_, l)| l).collect();
            (objects, layouts)
        };
        if !objects.is_empty() {
            warn!("[AshBackend] {} objects still alive at teardown", objects.len());
        }
        // Views before images, everything before the swapchain that owns its images.
        let (swapchains, rest): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .partition(|(_, object)| matches!(object, Object::Swapchain { .. }));
        let (views, rest): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|(_, object)| matches!(object, Object::ImageView(_)));
        for (_, object) in views.into_iter().chain(rest).chain(swapchains) {
            self.destroy_object(object);
        }

        unsafe {
            let device = &self.ctx.device;
            for layout in layouts {
                device.destroy_descriptor_set_layout(layout, None);
            }
            device.destroy_sampler(self.sampler, None);
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_command_pool(self.command_pool, None);
        }
        info!("[AshBackend] destroyed");
    }
}

fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::R32Sfloat => vk::Format::R32_SFLOAT,
        Format::D32Sfloat => vk::Format::D32_SFLOAT,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
    }
}

fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Access mask and pipeline stage that touch an image in `layout`.
fn layout_access(layout: ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        ImageLayout::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ImageLayout::ColorAttachment => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageLayout::DepthAttachment => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageLayout::PresentSrc => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    match stages {
        ShaderStages::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStages::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStages::VertexFragment => {
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        }
    }
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

fn vk_extent(extent: Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

fn attachment(
    format: Format,
    final_layout: ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(vk_format(format))
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk_layout(final_layout))
}

impl CommandRecorder for AshBackend {
    fn begin_render_pass(
        &self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear: &[ClearValue],
    ) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        let (Some(pass), Some(fb)) = (self.render_pass(render_pass), self.framebuffer(framebuffer))
        else {
            warn!(
                "[AshBackend] begin_render_pass with unknown pass {} or framebuffer {}",
                render_pass.0, framebuffer.0
            );
            return;
        };

        let clear_values: Vec<vk::ClearValue> = clear
            .iter()
            .map(|value| match *value {
                ClearValue::Color(color) => vk::ClearValue {
                    color: vk::ClearColorValue { float32: color },
                },
                ClearValue::Depth(depth) => vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                },
            })
            .collect();

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(fb)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk_extent(extent),
            })
            .clear_values(&clear_values);
        unsafe {
            self.device()
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    fn end_render_pass(&self, cmd: CommandBufferHandle) {
        if let Some(cmd) = self.recording_cmd(cmd) {
            unsafe { self.device().cmd_end_render_pass(cmd) };
        }
    }

    fn bind_pipeline(&self, cmd: CommandBufferHandle, pipeline: PipelineHandle) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        match self.pipeline(pipeline.0) {
            Some((pipeline, _, _)) => unsafe {
                self.device()
                    .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            },
            None => warn!("[AshBackend] bind of unknown pipeline {}", pipeline.0),
        }
    }

    fn bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        let (Some((_, layout, _)), Some(set)) = (self.pipeline(layout.0), self.descriptor_set(set))
        else {
            warn!("[AshBackend] bind_descriptor_set with unknown layout or set");
            return;
        };
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    fn bind_vertex_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        match self.buffer(buffer) {
            Some(buffer) => unsafe {
                self.device()
                    .cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[offset]);
            },
            None => warn!("[AshBackend] bind of unknown vertex buffer {}", buffer.0),
        }
    }

    fn bind_index_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, offset: u64) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        match self.buffer(buffer) {
            Some(buffer) => unsafe {
                self.device()
                    .cmd_bind_index_buffer(cmd, buffer, offset, vk::IndexType::UINT32);
            },
            None => warn!("[AshBackend] bind of unknown index buffer {}", buffer.0),
        }
    }

    fn push_constants(
        &self,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        _stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        // The layout declares a single range; pushes must name all of its stages.
        match self.pipeline(layout.0) {
            Some((_, layout, push_stages)) => unsafe {
                self.device()
                    .cmd_push_constants(cmd, layout, push_stages, offset, data);
            },
            None => warn!("[AshBackend] push to unknown layout {}", layout.0),
        }
    }

    fn set_viewport(&self, cmd: CommandBufferHandle, viewport: Viewport) {
        if let Some(cmd) = self.recording_cmd(cmd) {
            let viewport = vk::Viewport {
                x: viewport.x,
                y: viewport.y,
                width: viewport.width,
                height: viewport.height,
                min_depth: viewport.min_depth,
                max_depth: viewport.max_depth,
            };
            unsafe { self.device().cmd_set_viewport(cmd, 0, &[viewport]) };
        }
    }

    fn set_scissor(&self, cmd: CommandBufferHandle, extent: Extent2D) {
        if let Some(cmd) = self.recording_cmd(cmd) {
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk_extent(extent),
            };
            unsafe { self.device().cmd_set_scissor(cmd, 0, &[scissor]) };
        }
    }

    fn draw_indexed(
        &self,
        cmd: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        if let Some(cmd) = self.recording_cmd(cmd) {
            unsafe {
                self.device().cmd_draw_indexed(
                    cmd,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                );
            }
        }
    }

    fn transition_image(&self, cmd: CommandBufferHandle, transition: ImageTransition) {
        let Some(cmd) = self.recording_cmd(cmd) else {
            return;
        };
        let image = match self.image(transition.image) {
            Ok(image) => image,
            Err(e) => {
                warn!("[AshBackend] transition skipped: {e}");
                return;
            }
        };

        let (src_access, src_stage) = layout_access(transition.from);
        let (dst_access, dst_stage) = layout_access(transition.to);
        let aspect_mask = if transition.depth {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(vk_layout(transition.from))
            .new_layout(vk_layout(transition.to))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: transition.base_layer,
                layer_count: transition.layer_count,
            });

        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

impl GpuResourceProvider for AshBackend {
    fn name(&self) -> &str {
        "ash"
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle> {
        let mut usage = vk::ImageUsageFlags::empty();
        if desc.usage.color_attachment {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.usage.depth_attachment {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if desc.usage.sampled {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        let flags = match desc.kind {
            ImageKind::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(desc.kind.layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = unsafe {
            self.allocator
                .create_image(
                    &image_info,
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferDevice,
                        ..Default::default()
                    },
                )
                .map_err(|e| {
                    RenderError::ResourceCreationFailed(format!("image '{}': {e:?}", desc.label))
                })?
        };

        debug!(
            "[AshBackend] image '{}' {}x{} ({} layers)",
            desc.label,
            desc.extent.width,
            desc.extent.height,
            desc.kind.layer_count()
        );
        let id = self.table.lock().insert(Object::Image {
            image,
            allocation: Some(allocation),
        });
        Ok(ImageHandle(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.release(image.0);
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageViewHandle> {
        let image = self.image(desc.image)?;
        let (view_type, base_layer, layers) = match desc.kind {
            ViewKind::Single { layer } => (vk::ImageViewType::TYPE_2D, layer, 1),
            ViewKind::Array { base_layer, layers } => {
                (vk::ImageViewType::TYPE_2D_ARRAY, base_layer, layers)
            }
            ViewKind::Cube => (vk::ImageViewType::CUBE, 0, crate::config::CUBE_FACES),
        };

        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(vk_format(desc.format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect(desc.format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: base_layer,
                layer_count: layers,
            });

        let view = unsafe {
            self.device()
                .create_image_view(&create_info, None)
                .map_err(|e| RenderError::ResourceCreationFailed(format!("image view: {e}")))?
        };
        let id = self.table.lock().insert(Object::ImageView(view));
        Ok(ImageViewHandle(id))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.release(view.0);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let usage = match desc.usage {
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        };

        // Every buffer is CPU-written each frame or once at load.
        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(desc.size.max(1))
                        .usage(usage)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferHost,
                        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                        ..Default::default()
                    },
                )
                .map_err(|e| {
                    RenderError::ResourceCreationFailed(format!("buffer '{}': {e:?}", desc.label))
                })?
        };

        let id = self.table.lock().insert(Object::Buffer {
            buffer,
            allocation,
            size: desc.size,
        });
        Ok(BufferHandle(id))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut table = self.table.lock();
        let Some(Object::Buffer {
            allocation, size, ..
        }) = table.objects.get_mut(&buffer.0)
        else {
            return Err(Self::unknown("buffer", buffer.0));
        };

        let end = offset + data.len() as u64;
        if end > *size {
            return Err(RenderError::VulkanError(format!(
                "write of {} bytes at {offset} overflows buffer of {size} bytes",
                data.len()
            )));
        }

        unsafe {
            let mapped = self
                .allocator
                .map_memory(allocation)
                .map_err(|e| RenderError::VulkanError(format!("Failed to map buffer: {e:?}")))?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
            self.allocator.unmap_memory(allocation);
            self.allocator
                .flush_allocation(allocation, offset, data.len() as u64)
                .map_err(|e| RenderError::VulkanError(format!("Failed to flush buffer: {e:?}")))?;
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.release(buffer.0);
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<RenderPassHandle> {
        let mut attachments = Vec::with_capacity(2);
        let mut color_refs = Vec::with_capacity(1);
        let mut depth_ref = None;

        if let Some(color) = desc.color {
            color_refs.push(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            attachments.push(attachment(color.format, color.final_layout));
        }
        if let Some(depth) = desc.depth {
            depth_ref = Some(vk::AttachmentReference {
                attachment: attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            });
            attachments.push(attachment(depth.format, depth.final_layout));
        }

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth_ref) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }
        let subpasses = [subpass];

        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let attachment_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER | attachment_stages)
                .dst_stage_mask(attachment_stages)
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(attachment_access),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(attachment_access)
                .dst_access_mask(vk::AccessFlags::SHADER_READ),
        ];

        let view_masks = [desc.multiview_mask.unwrap_or(0)];
        let mut multiview_info = vk::RenderPassMultiviewCreateInfo::default()
            .view_masks(&view_masks)
            .correlation_masks(&view_masks);

        let mut create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        if desc.multiview_mask.is_some() {
            create_info = create_info.push_next(&mut multiview_info);
        }

        let pass = unsafe {
            self.device()
                .create_render_pass(&create_info, None)
                .map_err(|e| {
                    let message = format!("render pass '{}': {e}", desc.label);
                    RenderError::ResourceCreationFailed(message)
                })?
        };
        let id = self.table.lock().insert(Object::RenderPass(pass));
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        self.release(render_pass.0);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferHandle> {
        let pass = self
            .render_pass(desc.render_pass)
            .ok_or_else(|| Self::unknown("render pass", desc.render_pass.0))?;
        let views = desc
            .attachments
            .iter()
            .map(|&view| self.image_view(view).ok_or_else(|| Self::unknown("image view", view.0)))
            .collect::<Result<Vec<_>>>()?;

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(pass)
            .attachments(&views)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(desc.layers);
        let fb = unsafe {
            self.device()
                .create_framebuffer(&create_info, None)
                .map_err(|e| RenderError::ResourceCreationFailed(format!("framebuffer: {e}")))?
        };
        let id = self.table.lock().insert(Object::Framebuffer(fb));
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.release(framebuffer.0);
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<GraphicsPipeline> {
        let pass = self
            .render_pass(desc.render_pass)
            .ok_or_else(|| Self::unknown("render pass", desc.render_pass.0))?;
        let set_layouts = desc
            .set_layouts
            .iter()
            .map(|layout| self.set_layout(layout))
            .collect::<Result<Vec<_>>>()?;

        let push_stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let push_ranges = [vk::PushConstantRange {
            stage_flags: push_stages,
            offset: 0,
            size: desc.push_constant_size,
        }];
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if desc.push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&push_ranges);
        }
        let layout = unsafe {
            self.device()
                .create_pipeline_layout(&layout_info, None)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to create pipeline layout: {e}"))
                })?
        };

        let vertex_module = match self.create_shader_module(&desc.program.vertex) {
            Ok(module) => module,
            Err(e) => {
                unsafe { self.device().destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };
        let fragment_module = match desc.program.fragment.as_deref() {
            Some(code) => match self.create_shader_module(code) {
                Ok(module) => Some(module),
                Err(e) => unsafe {
                    self.device().destroy_shader_module(vertex_module, None);
                    self.device().destroy_pipeline_layout(layout, None);
                    return Err(e);
                },
            },
            None => None,
        };

        let mut stage_infos = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(c"main")];
        if let Some(module) = fragment_module {
            stage_infos.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(module)
                    .name(c"main"),
            );
        }

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.ctx.vertex_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = [vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        }];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let cull_mode = match desc.cull {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        };
        let mut rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        if let Some(bias) = desc.depth_bias {
            rasterization = rasterization
                .depth_bias_enable(true)
                .depth_bias_constant_factor(bias.constant)
                .depth_bias_slope_factor(bias.slope);
        }

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let blend_attachments: &[_] = if desc.color_attachment {
            &blend_attachments
        } else {
            &[]
        };
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(pass)
            .subpass(0);

        let created = unsafe {
            self.device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe {
            self.device().destroy_shader_module(vertex_module, None);
            if let Some(module) = fragment_module {
                self.device().destroy_shader_module(module, None);
            }
        }

        let pipeline = match created {
            Ok(pipelines) => pipelines.into_iter().next(),
            Err((_, e)) => {
                unsafe { self.device().destroy_pipeline_layout(layout, None) };
                return Err(RenderError::ResourceCreationFailed(format!(
                    "pipeline '{}': {e}",
                    desc.label
                )));
            }
        };
        let Some(pipeline) = pipeline else {
            unsafe { self.device().destroy_pipeline_layout(layout, None) };
            return Err(RenderError::ResourceCreationFailed(format!(
                "pipeline '{}': driver returned no pipeline",
                desc.label
            )));
        };

        info!("[AshBackend] pipeline '{}' created", desc.label);
        let id = self.table.lock().insert(Object::Pipeline {
            pipeline,
            layout,
            push_stages,
        });
        Ok(GraphicsPipeline {
            pipeline: PipelineHandle(id),
            layout: PipelineLayoutHandle(id),
        })
    }

    fn destroy_pipeline(&self, pipeline: GraphicsPipeline) {
        self.release(pipeline.pipeline.0);
    }

    fn create_descriptor_set(&self, desc: &DescriptorSetDesc) -> Result<DescriptorSetHandle> {
        let layout = self.set_layout(&desc.layout)?;
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(std::slice::from_ref(&layout));
        let set = unsafe {
            self.device()
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| {
                    RenderError::ResourceCreationFailed(format!("descriptor set: {e}"))
                })?
        }
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::ResourceCreationFailed("descriptor set".to_string()))?;

        // Resolve every payload up front so the write structs can borrow them.
        let mut buffer_infos = Vec::with_capacity(desc.writes.len());
        let mut image_infos = Vec::with_capacity(desc.writes.len());
        for write in &desc.writes {
            match write {
                DescriptorWrite::UniformBuffer { buffer, range, .. } => {
                    let resolved = match self.buffer(*buffer) {
                        Some(resolved) => resolved,
                        None => {
                            unsafe {
                                let _ = self
                                    .device()
                                    .free_descriptor_sets(self.descriptor_pool, &[set]);
                            }
                            return Err(Self::unknown("buffer", buffer.0));
                        }
                    };
                    buffer_infos.push([vk::DescriptorBufferInfo {
                        buffer: resolved,
                        offset: 0,
                        range: *range,
                    }]);
                }
                DescriptorWrite::SampledImages { views, .. } => {
                    let mut infos = Vec::with_capacity(views.len());
                    for view in views {
                        let Some(resolved) = self.image_view(*view) else {
                            unsafe {
                                let _ = self
                                    .device()
                                    .free_descriptor_sets(self.descriptor_pool, &[set]);
                            }
                            return Err(Self::unknown("image view", view.0));
                        };
                        infos.push(vk::DescriptorImageInfo {
                            sampler: self.sampler,
                            image_view: resolved,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        });
                    }
                    image_infos.push(infos);
                }
            }
        }

        let mut buffers = buffer_infos.iter();
        let mut images = image_infos.iter();
        let writes: Vec<vk::WriteDescriptorSet> = desc
            .writes
            .iter()
            .filter_map(|write| match write {
                DescriptorWrite::UniformBuffer { binding, .. } => buffers.next().map(|info| {
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(*binding)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(info)
                }),
                DescriptorWrite::SampledImages { binding, .. } => images
                    .next()
                    .filter(|info| !info.is_empty())
                    .map(|info| {
                        vk::WriteDescriptorSet::default()
                            .dst_set(set)
                            .dst_binding(*binding)
                            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                            .image_info(info)
                    }),
            })
            .collect();

        unsafe { self.device().update_descriptor_sets(&writes, &[]) };

        let id = self.table.lock().insert(Object::DescriptorSet(set));
        Ok(DescriptorSetHandle(id))
    }

    fn destroy_descriptor_set(&self, set: DescriptorSetHandle) {
        self.release(set.0);
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        let sem = unsafe {
            self.device()
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(|e| RenderError::ResourceCreationFailed(format!("semaphore: {e}")))?
        };
        let id = self.table.lock().insert(Object::Semaphore(sem));
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.release(semaphore.0);
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device()
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
                .map_err(|e| RenderError::ResourceCreationFailed(format!("fence: {e}")))?
        };
        let id = self.table.lock().insert(Object::Fence(fence));
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.release(fence.0);
    }

    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> Result<FenceStatus> {
        let fence = self.fence(fence)?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device().wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
            Err(e) => Err(RenderError::VulkanError(format!("Failed to wait for fence: {e}"))),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        let fence = self.fence(fence)?;
        unsafe {
            self.device()
                .reset_fences(&[fence])
                .map_err(|e| RenderError::VulkanError(format!("Failed to reset fence: {e}")))
        }
    }

    fn allocate_command_buffer(&self) -> Result<CommandBufferHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe {
            self.device()
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to allocate command buffers: {e}"))
                })?
        }
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::ResourceCreationFailed("command buffer".to_string()))?;

        let id = self.table.lock().insert(Object::CommandBuffer(cmd));
        Ok(CommandBufferHandle(id))
    }

    fn free_command_buffer(&self, cmd: CommandBufferHandle) {
        self.release(cmd.0);
    }

    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let raw = self
            .command_buffer(cmd)
            .ok_or_else(|| Self::unknown("command buffer", cmd.0))?;
        unsafe {
            self.device()
                .reset_command_buffer(raw, vk::CommandBufferResetFlags::empty())
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to reset command buffer: {e}"))
                })
        }
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let raw = self
            .command_buffer(cmd)
            .ok_or_else(|| Self::unknown("command buffer", cmd.0))?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device()
                .begin_command_buffer(raw, &begin_info)
                .map_err(|e| {
                    RenderError::VulkanError(format!("Failed to begin command buffer: {e}"))
                })
        }
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let raw = self
            .command_buffer(cmd)
            .ok_or_else(|| Self::unknown("command buffer", cmd.0))?;
        unsafe {
            self.device()
                .end_command_buffer(raw)
                .map_err(|e| RenderError::VulkanError(format!("Failed to end command buffer: {e}")))
        }
    }

    fn submit(&self, desc: &SubmitDesc) -> Result<()> {
        let cmd = self
            .command_buffer(desc.command_buffer)
            .ok_or_else(|| Self::unknown("command buffer", desc.command_buffer.0))?;
        let wait = desc.wait.map(|s| self.semaphore(s)).transpose()?;
        let signal = desc.signal.map(|s| self.semaphore(s)).transpose()?;
        let fence = match desc.fence {
            Some(fence) => self.fence(fence)?,
            None => vk::Fence::null(),
        };

        let wait_semaphores: Vec<_> = wait.into_iter().collect();
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores: Vec<_> = signal.into_iter().collect();
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages[..wait_semaphores.len()])
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device()
                .queue_submit(self.ctx.queue, &[submit_info], fence)
                .map_err(|e| RenderError::VulkanError(format!("Failed to submit queue: {e}")))
        }
    }

    fn surface_extent(&self) -> Extent2D {
        let capabilities = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_capabilities(
                    self.ctx.physical_device,
                    self.ctx.surface,
                )
        };
        match capabilities {
            // u32::MAX means the swapchain decides; fall back to the window size.
            Ok(caps) if caps.current_extent.width == u32::MAX => {
                let window = *self.window_extent.lock();
                Extent2D::new(
                    window
                        .width
                        .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                    window
                        .height
                        .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
                )
            }
            Ok(caps) => Extent2D::new(caps.current_extent.width, caps.current_extent.height),
            Err(e) => {
                warn!("[AshBackend] surface capabilities query failed: {e}");
                Extent2D::default()
            }
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainInfo> {
        let surface_support = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_support(
                    self.ctx.physical_device,
                    self.ctx.queue_family,
                    self.ctx.surface,
                )
                .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?
        };
        if !surface_support {
            return Err(RenderError::SwapchainCreationFailed(
                "Surface not supported by queue family".to_string(),
            ));
        }

        let capabilities = unsafe {
            self.ctx
                .surface_loader
                .get_physical_device_surface_capabilities(
                    self.ctx.physical_device,
                    self.ctx.surface,
                )
                .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?
        };
        let (surface_format, format) = self.pick_surface_format()?;

        let image_count = if capabilities.max_image_count > 0 {
            desc.min_image_count
                .max(capabilities.min_image_count)
                .min(capabilities.max_image_count)
        } else {
            desc.min_image_count.max(capabilities.min_image_count)
        };

        let old_swapchain = match desc.old {
            Some(old) => self.swapchain(old)?,
            None => vk::SwapchainKHR::null(),
        };

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.ctx.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(vk_extent(desc.extent))
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&swapchain_create_info, None)
                .map_err(|e| RenderError::SwapchainCreationFailed(format!("{e:?}")))?
        };

        let raw_images = match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(RenderError::SwapchainCreationFailed(format!("{e:?}")));
            }
        };

        let mut images = Vec::with_capacity(raw_images.len());
        let mut image_views = Vec::with_capacity(raw_images.len());
        for raw in raw_images {
            let image = ImageHandle(self.table.lock().insert(Object::Image {
                image: raw,
                allocation: None,
            }));
            images.push(image);
            let view = self.create_image_view(&ImageViewDesc {
                image,
                format,
                kind: ViewKind::Single { layer: 0 },
            });
            match view {
                Ok(view) => image_views.push(view),
                Err(e) => {
                    for view in image_views {
                        self.release(view.0);
                    }
                    for image in images {
                        self.release(image.0);
                    }
                    unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                    return Err(RenderError::SwapchainCreationFailed(e.to_string()));
                }
            }
        }

        info!(
            "[AshBackend] swapchain created with {} images ({}x{})",
            images.len(),
            desc.extent.width,
            desc.extent.height
        );

        let id = self.table.lock().insert(Object::Swapchain {
            swapchain,
            images: images.iter().map(|i| i.0).collect(),
            views: image_views.iter().map(|v| v.0).collect(),
        });
        Ok(SwapchainInfo {
            handle: SwapchainHandle(id),
            extent: desc.extent,
            format,
            images,
            image_views,
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let entry = self.table.lock().objects.remove(&swapchain.0);
        match entry {
            Some(Object::Swapchain {
                swapchain,
                images,
                views,
            }) => {
                for id in views.into_iter().chain(images) {
                    self.release(id);
                }
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
            }
            Some(other) => {
                warn!("[AshBackend] handle {} is not a swapchain", swapchain.0);
                self.table.lock().objects.insert(swapchain.0, other);
            }
            None => warn!("[AshBackend] destroy of unknown swapchain {}", swapchain.0),
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        timeout: Duration,
    ) -> Result<AcquireOutcome> {
        let swapchain = self.swapchain(swapchain)?;
        let semaphore = self.semaphore(signal)?;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

        match unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        } {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e @ (vk::Result::TIMEOUT | vk::Result::NOT_READY)) => Err(
                RenderError::FrameAcquisitionFailed(format!("acquire_next_image: {e:?}")),
            ),
            Err(e) => Err(RenderError::VulkanError(format!(
                "Failed to acquire swapchain image: {e:?}"
            ))),
        }
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain(swapchain)?];
        let wait_semaphores = [self.semaphore(wait)?];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe {
            self.swapchain_loader
                .queue_present(self.ctx.queue, &present_info)
        } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(RenderError::VulkanError(format!("Failed to present: {e:?}"))),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device()
                .device_wait_idle()
                .map_err(|e| RenderError::VulkanError(format!("device_wait_idle failed: {e}")))
        }
    }
}
