//! In-memory provider that records every call.
//!
//! `RecordingBackend` hands out unique handles, tracks which objects are alive and
//! logs commands as [`GpuCall`]s. Submitted work completes immediately: the fence of
//! a submission is signalled on `submit`. Acquire and present outcomes can be
//! scripted to simulate a stale swapchain, and creation can be made to fail.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use super::*;
use crate::error::{RenderError, Result};

/// Kind of object tracked by the recording backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    ImageView,
    Buffer,
    RenderPass,
    Framebuffer,
    Pipeline,
    DescriptorSet,
    Semaphore,
    Fence,
    CommandBuffer,
    Swapchain,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    Create { kind: ResourceKind, handle: u64 },
    Destroy { kind: ResourceKind, handle: u64 },
    WriteBuffer { buffer: BufferHandle, offset: u64, len: usize },
    BeginRenderPass {
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
    },
    EndRenderPass { cmd: CommandBufferHandle },
    BindPipeline { cmd: CommandBufferHandle, pipeline: PipelineHandle },
    BindDescriptorSet { cmd: CommandBufferHandle, set_index: u32, set: DescriptorSetHandle },
    BindVertexBuffer { cmd: CommandBufferHandle, buffer: BufferHandle },
    BindIndexBuffer { cmd: CommandBufferHandle, buffer: BufferHandle },
    PushConstants { cmd: CommandBufferHandle, offset: u32, data: Vec<u8> },
    SetViewport { cmd: CommandBufferHandle, viewport: Viewport },
    SetScissor { cmd: CommandBufferHandle, extent: Extent2D },
    DrawIndexed { cmd: CommandBufferHandle, index_count: u32, instance_count: u32 },
    TransitionImage { cmd: CommandBufferHandle, transition: ImageTransition },
    WaitFence { fence: FenceHandle },
    ResetFence { fence: FenceHandle },
    ResetCommandBuffer { cmd: CommandBufferHandle },
    BeginCommandBuffer { cmd: CommandBufferHandle },
    EndCommandBuffer { cmd: CommandBufferHandle },
    Submit(SubmitDesc),
    Acquire { semaphore: SemaphoreHandle, outcome: AcquireOutcome },
    Present { image_index: u32, wait: SemaphoreHandle, outcome: PresentOutcome },
    CreateSwapchain {
        handle: SwapchainHandle,
        extent: Extent2D,
        image_count: u32,
        old: Option<SwapchainHandle>,
    },
    WaitIdle,
}

struct SwapchainState {
    image_count: u32,
    next_image: u32,
    owned: Vec<(ResourceKind, u64)>,
}

struct RecordingState {
    next_handle: u64,
    calls: Vec<GpuCall>,
    live: HashMap<u64, ResourceKind>,
    buffers: HashMap<u64, Vec<u8>>,
    fences: HashMap<u64, bool>,
    swapchains: HashMap<u64, SwapchainState>,
    image_count: u32,
    surface_extent: Extent2D,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    fail_creation_after: Option<usize>,
    creations: usize,
    hang_fences: bool,
}

impl RecordingState {
    fn allocate(&mut self, kind: ResourceKind) -> Result<u64> {
        if let Some(limit) = self.fail_creation_after {
            if self.creations >= limit {
                return Err(RenderError::ResourceCreationFailed(format!(
                    "{kind:?} creation refused after {limit} objects"
                )));
            }
        }
        self.creations += 1;
        self.next_handle += 1;
        let handle = self.next_handle;
        self.live.insert(handle, kind);
        self.calls.push(GpuCall::Create { kind, handle });
        Ok(handle)
    }

    fn release(&mut self, kind: ResourceKind, handle: u64) {
        match self.live.remove(&handle) {
            Some(found) if found == kind => {
                self.calls.push(GpuCall::Destroy { kind, handle });
            }
            Some(found) => {
                log::error!("[RecordingBackend] destroy {kind:?} {handle} but it is a {found:?}");
                self.live.insert(handle, found);
            }
            None => {
                log::error!("[RecordingBackend] destroy of unknown {kind:?} {handle}");
            }
        }
    }

    fn expect_live(&self, kind: ResourceKind, handle: u64) -> Result<()> {
        match self.live.get(&handle) {
            Some(found) if *found == kind => Ok(()),
            _ => Err(RenderError::UnknownHandle(format!("{kind:?} {handle}"))),
        }
    }
}

/// In-memory [`GpuResourceProvider`] for tests and headless runs.
pub struct RecordingBackend {
    state: Mutex<RecordingState>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::with_surface(Extent2D::new(1280, 720), 3)
    }

    /// Backend whose swapchains have `image_count` images of `extent`.
    pub fn with_surface(extent: Extent2D, image_count: u32) -> Self {
        Self {
            state: Mutex::new(RecordingState {
                next_handle: 0,
                calls: Vec::new(),
                live: HashMap::new(),
                buffers: HashMap::new(),
                fences: HashMap::new(),
                swapchains: HashMap::new(),
                image_count: image_count.max(1),
                surface_extent: extent,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                fail_creation_after: None,
                creations: 0,
                hang_fences: false,
            }),
        }
    }

    /// Changes what the next swapchain will look like; a zero extent simulates minimisation.
    pub fn set_surface(&self, extent: Extent2D, image_count: u32) {
        let mut state = self.state.lock();
        state.surface_extent = extent;
        state.image_count = image_count.max(1);
    }

    /// Queues an outcome returned by a future acquire instead of the next image.
    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// Every creation after `count` more successful ones fails.
    pub fn fail_creation_after(&self, count: usize) {
        let mut state = self.state.lock();
        state.fail_creation_after = Some(state.creations + count);
    }

    /// Submissions stop signalling their fences, so fence waits time out.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang_fences = hang;
    }

    pub fn calls(&self) -> Vec<GpuCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, predicate: impl Fn(&GpuCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_count_of(&self, kind: ResourceKind) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn is_live(&self, handle: u64) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    /// Last bytes written to `buffer`.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.0).cloned()
    }

    fn record(&self, call: GpuCall) {
        self.state.lock().calls.push(call);
    }
}

impl CommandRecorder for RecordingBackend {
    fn begin_render_pass(
        &self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        _clear: &[ClearValue],
    ) {
        self.record(GpuCall::BeginRenderPass {
            cmd,
            render_pass,
            framebuffer,
            extent,
        });
    }

    fn end_render_pass(&self, cmd: CommandBufferHandle) {
        self.record(GpuCall::EndRenderPass { cmd });
    }

    fn bind_pipeline(&self, cmd: CommandBufferHandle, pipeline: PipelineHandle) {
        self.record(GpuCall::BindPipeline { cmd, pipeline });
    }

    fn bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        set_index: u32,
        set: DescriptorSetHandle,
    ) {
        self.record(GpuCall::BindDescriptorSet {
            cmd,
            set_index,
            set,
        });
    }

    fn bind_vertex_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, _offset: u64) {
        self.record(GpuCall::BindVertexBuffer { cmd, buffer });
    }

    fn bind_index_buffer(&self, cmd: CommandBufferHandle, buffer: BufferHandle, _offset: u64) {
        self.record(GpuCall::BindIndexBuffer { cmd, buffer });
    }

    fn push_constants(
        &self,
        cmd: CommandBufferHandle,
        _layout: PipelineLayoutHandle,
        _stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        self.record(GpuCall::PushConstants {
            cmd,
            offset,
            data: data.to_vec(),
        });
    }

    fn set_viewport(&self, cmd: CommandBufferHandle, viewport: Viewport) {
        self.record(GpuCall::SetViewport { cmd, viewport });
    }

    fn set_scissor(&self, cmd: CommandBufferHandle, extent: Extent2D) {
        self.record(GpuCall::SetScissor { cmd, extent });
    }

    fn draw_indexed(
        &self,
        cmd: CommandBufferHandle,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(GpuCall::DrawIndexed {
            cmd,
            index_count,
            instance_count,
        });
    }

    fn transition_image(&self, cmd: CommandBufferHandle, transition: ImageTransition) {
        self.record(GpuCall::TransitionImage { cmd, transition });
    }
}

impl GpuResourceProvider for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn create_image(&self, _desc: &ImageDesc) -> Result<ImageHandle> {
        self.state.lock().allocate(ResourceKind::Image).map(ImageHandle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.lock().release(ResourceKind::Image, image.0);
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<ImageViewHandle> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::Image, desc.image.0)?;
        state.allocate(ResourceKind::ImageView).map(ImageViewHandle)
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        self.state.lock().release(ResourceKind::ImageView, view.0);
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        let handle = state.allocate(ResourceKind::Buffer)?;
        state.buffers.insert(handle, vec![0; desc.size as usize]);
        Ok(BufferHandle(handle))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::Buffer, buffer.0)?;
        let contents = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| RenderError::UnknownHandle(format!("buffer {}", buffer.0)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(RenderError::ResourceCreationFailed(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        state.calls.push(GpuCall::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.0);
        state.release(ResourceKind::Buffer, buffer.0);
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> Result<RenderPassHandle> {
        self.state.lock().allocate(ResourceKind::RenderPass).map(RenderPassHandle)
    }

    fn destroy_render_pass(&self, render_pass: RenderPassHandle) {
        self.state.lock().release(ResourceKind::RenderPass, render_pass.0);
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<FramebufferHandle> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::RenderPass, desc.render_pass.0)?;
        for view in &desc.attachments {
            state.expect_live(ResourceKind::ImageView, view.0)?;
        }
        state.allocate(ResourceKind::Framebuffer).map(FramebufferHandle)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        self.state.lock().release(ResourceKind::Framebuffer, framebuffer.0);
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<GraphicsPipeline> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::RenderPass, desc.render_pass.0)?;
        let handle = state.allocate(ResourceKind::Pipeline)?;
        Ok(GraphicsPipeline {
            pipeline: PipelineHandle(handle),
            layout: PipelineLayoutHandle(handle),
        })
    }

    fn destroy_pipeline(&self, pipeline: GraphicsPipeline) {
        self.state.lock().release(ResourceKind::Pipeline, pipeline.pipeline.0);
    }

    fn create_descriptor_set(&self, desc: &DescriptorSetDesc) -> Result<DescriptorSetHandle> {
        let mut state = self.state.lock();
        for write in &desc.writes {
            match write {
                DescriptorWrite::UniformBuffer { buffer, .. } => {
                    state.expect_live(ResourceKind::Buffer, buffer.0)?;
                }
                DescriptorWrite::SampledImages { views, .. } => {
                    for view in views {
                        state.expect_live(ResourceKind::ImageView, view.0)?;
                    }
                }
            }
        }
        state.allocate(ResourceKind::DescriptorSet).map(DescriptorSetHandle)
    }

    fn destroy_descriptor_set(&self, set: DescriptorSetHandle) {
        self.state.lock().release(ResourceKind::DescriptorSet, set.0);
    }

    fn create_semaphore(&self) -> Result<SemaphoreHandle> {
        self.state.lock().allocate(ResourceKind::Semaphore).map(SemaphoreHandle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.lock().release(ResourceKind::Semaphore, semaphore.0);
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle> {
        let mut state = self.state.lock();
        let handle = state.allocate(ResourceKind::Fence)?;
        state.fences.insert(handle, signaled);
        Ok(FenceHandle(handle))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.0);
        state.release(ResourceKind::Fence, fence.0);
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout: Duration) -> Result<FenceStatus> {
        let mut state = self.state.lock();
        let signaled = *state
            .fences
            .get(&fence.0)
            .ok_or_else(|| RenderError::UnknownHandle(format!("fence {}", fence.0)))?;
        state.calls.push(GpuCall::WaitFence { fence });
        Ok(if signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::TimedOut
        })
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<()> {
        let mut state = self.state.lock();
        let signaled = state
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| RenderError::UnknownHandle(format!("fence {}", fence.0)))?;
        *signaled = false;
        state.calls.push(GpuCall::ResetFence { fence });
        Ok(())
    }

    fn allocate_command_buffer(&self) -> Result<CommandBufferHandle> {
        self.state.lock().allocate(ResourceKind::CommandBuffer).map(CommandBufferHandle)
    }

    fn free_command_buffer(&self, cmd: CommandBufferHandle) {
        self.state.lock().release(ResourceKind::CommandBuffer, cmd.0);
    }

    fn reset_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::CommandBuffer, cmd.0)?;
        state.calls.push(GpuCall::ResetCommandBuffer { cmd });
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::CommandBuffer, cmd.0)?;
        state.calls.push(GpuCall::BeginCommandBuffer { cmd });
        Ok(())
    }

    fn end_command_buffer(&self, cmd: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::CommandBuffer, cmd.0)?;
        state.calls.push(GpuCall::EndCommandBuffer { cmd });
        Ok(())
    }

    fn submit(&self, desc: &SubmitDesc) -> Result<()> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::CommandBuffer, desc.command_buffer.0)?;
        if let Some(fence) = desc.fence {
            let hang = state.hang_fences;
            let signaled = state
                .fences
                .get_mut(&fence.0)
                .ok_or_else(|| RenderError::UnknownHandle(format!("fence {}", fence.0)))?;
            *signaled = !hang;
        }
        state.calls.push(GpuCall::Submit(*desc));
        Ok(())
    }

    fn surface_extent(&self) -> Extent2D {
        self.state.lock().surface_extent
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainInfo> {
        let mut state = self.state.lock();
        let image_count = state.image_count.max(desc.min_image_count);
        let handle = SwapchainHandle(state.allocate(ResourceKind::Swapchain)?);

        let mut images = Vec::with_capacity(image_count as usize);
        let mut image_views = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            images.push(ImageHandle(state.allocate(ResourceKind::Image)?));
            image_views.push(ImageViewHandle(state.allocate(ResourceKind::ImageView)?));
        }

        state.swapchains.insert(
            handle.0,
            SwapchainState {
                image_count,
                next_image: 0,
                owned: images
                    .iter()
                    .map(|image| (ResourceKind::Image, image.0))
                    .chain(image_views.iter().map(|view| (ResourceKind::ImageView, view.0)))
                    .collect(),
            },
        );
        state.calls.push(GpuCall::CreateSwapchain {
            handle,
            extent: desc.extent,
            image_count,
            old: desc.old,
        });
        debug!(
            "[RecordingBackend] swapchain {} with {image_count} images at {}x{}",
            handle.0, desc.extent.width, desc.extent.height
        );

        Ok(SwapchainInfo {
            handle,
            extent: desc.extent,
            format: Format::Bgra8Srgb,
            images,
            image_views,
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(chain) = state.swapchains.remove(&swapchain.0) {
            for (kind, handle) in chain.owned {
                state.release(kind, handle);
            }
        }
        state.release(ResourceKind::Swapchain, swapchain.0);
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        _timeout: Duration,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::Semaphore, signal.0)?;
        let outcome = match state.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None => {
                let chain = state.swapchains.get_mut(&swapchain.0).ok_or_else(|| {
                    let message = format!("unknown swapchain {}", swapchain.0);
                    RenderError::FrameAcquisitionFailed(message)
                })?;
                let index = chain.next_image;
                chain.next_image = (chain.next_image + 1) % chain.image_count;
                AcquireOutcome::Acquired {
                    index,
                    suboptimal: false,
                }
            }
        };
        state.calls.push(GpuCall::Acquire {
            semaphore: signal,
            outcome,
        });
        Ok(outcome)
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        state.expect_live(ResourceKind::Swapchain, swapchain.0)?;
        let outcome = state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented);
        state.calls.push(GpuCall::Present {
            image_index,
            wait,
            outcome,
        });
        Ok(outcome)
    }

    fn wait_idle(&self) -> Result<()> {
        self.record(GpuCall::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_signals_fence() {
        let backend = RecordingBackend::new();
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        assert_eq!(
            backend.wait_fence(fence, Duration::from_millis(1)).unwrap(),
            FenceStatus::TimedOut
        );
        backend
            .submit(&SubmitDesc {
                command_buffer: cmd,
                wait: None,
                signal: None,
                fence: Some(fence),
            })
            .unwrap();
        assert_eq!(
            backend.wait_fence(fence, Duration::from_millis(1)).unwrap(),
            FenceStatus::Signaled
        );
    }

    #[test]
    fn swapchain_images_are_released_with_it() {
        let backend = RecordingBackend::with_surface(Extent2D::new(800, 600), 3);
        let info = backend
            .create_swapchain(&SwapchainDesc {
                extent: Extent2D::new(800, 600),
                min_image_count: 2,
                old: None,
            })
            .unwrap();
        assert_eq!(info.image_count(), 3);
        assert_eq!(backend.live_count(), 7);
        backend.destroy_swapchain(info.handle);
        assert_eq!(backend.live_count(), 0);
    }

    #[test]
    fn acquire_cycles_images_and_honours_script() {
        let backend = RecordingBackend::with_surface(Extent2D::new(64, 64), 2);
        let semaphore = backend.create_semaphore().unwrap();
        let info = backend
            .create_swapchain(&SwapchainDesc {
                extent: Extent2D::new(64, 64),
                min_image_count: 2,
                old: None,
            })
            .unwrap();
        let timeout = Duration::from_secs(1);
        backend.script_acquire(AcquireOutcome::OutOfDate);
        assert_eq!(
            backend.acquire_next_image(info.handle, semaphore, timeout).unwrap(),
            AcquireOutcome::OutOfDate
        );
        for expected in [0, 1, 0] {
            assert_eq!(
                backend.acquire_next_image(info.handle, semaphore, timeout).unwrap(),
                AcquireOutcome::Acquired {
                    index: expected,
                    suboptimal: false
                }
            );
        }
    }

    #[test]
    fn creation_failure_can_be_injected() {
        let backend = RecordingBackend::new();
        backend.fail_creation_after(1);
        assert!(backend.create_semaphore().is_ok());
        assert!(matches!(
            backend.create_semaphore(),
            Err(RenderError::ResourceCreationFailed(_))
        ));
    }
}
