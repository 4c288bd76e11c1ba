use std::sync::Arc;

use crate::error::Result;
use crate::gpu::{CommandBufferHandle, FenceHandle, GpuResourceProvider, SemaphoreHandle};

/// Synchronization primitives and the command buffer for one frame index.
pub struct FrameSyncSet<G: GpuResourceProvider> {
    gpu: Arc<G>,
    pub image_available: SemaphoreHandle,
    pub render_finished: SemaphoreHandle,
    /// Created signalled so the first wait on it returns immediately.
    pub in_flight: FenceHandle,
    pub command_buffer: CommandBufferHandle,
}

impl<G: GpuResourceProvider> FrameSyncSet<G> {
    pub fn new(gpu: Arc<G>) -> Result<Self> {
        let mut set = Self {
            gpu,
            image_available: SemaphoreHandle::NULL,
            render_finished: SemaphoreHandle::NULL,
            in_flight: FenceHandle::NULL,
            command_buffer: CommandBufferHandle::NULL,
        };
        set.image_available = set.gpu.create_semaphore()?;
        set.render_finished = set.gpu.create_semaphore()?;
        set.in_flight = set.gpu.create_fence(true)?;
        set.command_buffer = set.gpu.allocate_command_buffer()?;
        Ok(set)
    }
}

impl<G: GpuResourceProvider> Drop for FrameSyncSet<G> {
    fn drop(&mut self) {
        if !self.command_buffer.is_null() {
            self.gpu.free_command_buffer(self.command_buffer);
        }
        if !self.in_flight.is_null() {
            self.gpu.destroy_fence(self.in_flight);
        }
        if !self.render_finished.is_null() {
            self.gpu.destroy_semaphore(self.render_finished);
        }
        if !self.image_available.is_null() {
            self.gpu.destroy_semaphore(self.image_available);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{FenceStatus, RecordingBackend};
    use std::time::Duration;

    #[test]
    fn fence_starts_signalled_and_drop_releases_everything() {
        let gpu = Arc::new(RecordingBackend::new());
        let set = FrameSyncSet::new(gpu.clone()).unwrap();
        assert_eq!(
            gpu.wait_fence(set.in_flight, Duration::ZERO).unwrap(),
            FenceStatus::Signaled
        );
        assert_eq!(gpu.live_count(), 4);
        drop(set);
        assert_eq!(gpu.live_count(), 0);
    }
}
