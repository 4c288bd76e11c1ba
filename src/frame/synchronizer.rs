//! Multi-buffered frame loop around acquire / submit / present.
//!
//! The synchronizer owns the swapchain and one [`FrameSyncSet`] per swapchain image.
//! Semaphores are picked by the rotating frame index, while the fence and command
//! buffer are picked by the acquired image index, so a command buffer is never
//! re-recorded while the GPU may still execute it.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::sync::FrameSyncSet;
use crate::config::FrameConfig;
use crate::error::{RenderError, Result};
use crate::gpu::{
    AcquireOutcome, CommandBufferHandle, Extent2D, FenceStatus, GpuResourceProvider,
    ImageViewHandle, PresentOutcome, SubmitDesc, SwapchainDesc, SwapchainInfo,
};
use crate::utils::timing::{FrameBudget, FrameTimings, SectionTimer};

/// Everything a recorder needs for one frame. Handles only; nothing is borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub command_buffer: CommandBufferHandle,
    pub image_index: u32,
    pub frame_index: usize,
    pub extent: Extent2D,
    pub image_view: ImageViewHandle,
}

/// Per-frame command recording plus swapchain-dependent resource rebuilds.
pub trait FrameRecorder {
    /// Records the frame into `ctx.command_buffer`, which is already begun.
    fn record(&mut self, ctx: &FrameContext) -> Result<()>;

    /// Called after every swapchain recreation, before new sync sets exist.
    fn rebuild(&mut self, _swapchain: &SwapchainInfo) -> Result<()> {
        Ok(())
    }
}

impl<F> FrameRecorder for F
where
    F: FnMut(&FrameContext) -> Result<()>,
{
    fn record(&mut self, ctx: &FrameContext) -> Result<()> {
        self(ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Running,
    Recreating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Submitted and presented.
    Presented,
    /// The swapchain was rebuilt. The frame may or may not have been presented.
    Recreated,
    /// Nothing was submitted (surface has zero extent).
    Skipped,
}

/// Counters kept across the lifetime of a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub frames_presented: u64,
    pub recreations: u64,
    pub skipped_frames: u64,
    pub out_of_date_acquires: u64,
    pub over_budget_frames: u64,
}

pub struct FrameSynchronizer<G: GpuResourceProvider> {
    gpu: Arc<G>,
    config: FrameConfig,
    swapchain: Option<SwapchainInfo>,
    syncs: Vec<FrameSyncSet<G>>,
    current_frame: usize,
    resize_pending: bool,
    state: SyncState,
    stats: FrameStats,
    budget: FrameBudget,
    last_timings: FrameTimings,
}

impl<G: GpuResourceProvider> FrameSynchronizer<G> {
    /// Creates the initial swapchain and sync sets. The surface must have a non-zero extent.
    pub fn new(gpu: Arc<G>, config: FrameConfig) -> Result<Self> {
        let extent = gpu.surface_extent();
        if extent.is_zero() {
            return Err(RenderError::SwapchainCreationFailed(
                "surface has zero extent".to_string(),
            ));
        }

        let swapchain = gpu.create_swapchain(&SwapchainDesc {
            extent,
            min_image_count: config.frames_in_flight,
            old: None,
        })?;

        let mut synchronizer = Self {
            gpu,
            config,
            swapchain: Some(swapchain),
            syncs: Vec::new(),
            current_frame: 0,
            resize_pending: false,
            state: SyncState::Running,
            stats: FrameStats::default(),
            budget: FrameBudget::from_millis(config.frame_budget_ms),
            last_timings: FrameTimings::default(),
        };
        synchronizer.create_sync_sets()?;

        info!(
            "[FrameSynchronizer] {} frames in flight at {}x{}",
            synchronizer.syncs.len(),
            extent.width,
            extent.height
        );
        Ok(synchronizer)
    }

    pub fn swapchain(&self) -> Option<&SwapchainInfo> {
        self.swapchain.as_ref()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Number of frame slots (equal to the swapchain image count).
    pub fn frames_in_flight(&self) -> usize {
        self.syncs.len()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Section timings of the most recent submitted frame.
    pub fn last_timings(&self) -> FrameTimings {
        self.last_timings
    }

    /// Marks the swapchain stale; it is rebuilt at the start or end of the next frame.
    pub fn request_resize(&mut self) {
        self.resize_pending = true;
    }

    pub fn resize_pending(&self) -> bool {
        self.resize_pending
    }

    fn create_sync_sets(&mut self) -> Result<()> {
        let count = self
            .swapchain
            .as_ref()
            .map_or(0, |swapchain| swapchain.image_count());
        for _ in 0..count {
            self.syncs.push(FrameSyncSet::new(self.gpu.clone())?);
        }
        Ok(())
    }

    fn drop_sync_sets(&mut self) {
        while let Some(set) = self.syncs.pop() {
            drop(set);
        }
    }

    /// Rebuilds the swapchain and everything sized by it. Returns `false` while the
    /// surface has zero extent, leaving the rebuild pending.
    pub fn recreate(&mut self, recorder: &mut impl FrameRecorder) -> Result<bool> {
        self.resize_pending = true;
        let extent = self.gpu.surface_extent();
        if extent.is_zero() {
            warn!("[FrameSynchronizer] surface extent is zero; deferring recreation");
            return Ok(false);
        }

        self.state = SyncState::Recreating;
        self.gpu.wait_idle()?;
        self.drop_sync_sets();

        let old = self.swapchain.take();
        let created = self.gpu.create_swapchain(&SwapchainDesc {
            extent,
            min_image_count: self.config.frames_in_flight,
            old: old.as_ref().map(|swapchain| swapchain.handle),
        });
        if let Some(old) = old {
            self.gpu.destroy_swapchain(old.handle);
        }
        let swapchain = match created {
            Ok(swapchain) => swapchain,
            Err(err) => {
                self.state = SyncState::Running;
                return Err(err);
            }
        };

        // Owned by `self` before rebuilding so a failure cannot strand it.
        let rebuilt = recorder.rebuild(&swapchain);
        self.swapchain = Some(swapchain);
        if let Err(err) = rebuilt.and_then(|()| self.create_sync_sets()) {
            error!("[FrameSynchronizer] recreation failed, retrying next frame: {err}");
            self.state = SyncState::Running;
            return Err(err);
        }

        self.current_frame = 0;
        self.resize_pending = false;
        self.state = SyncState::Running;
        self.stats.recreations += 1;
        info!(
            "[FrameSynchronizer] swapchain recreated: {} images at {}x{}",
            self.syncs.len(),
            extent.width,
            extent.height
        );
        Ok(true)
    }

    fn recreate_outcome(&mut self, recorder: &mut impl FrameRecorder) -> Result<FrameOutcome> {
        if self.recreate(recorder)? {
            Ok(FrameOutcome::Recreated)
        } else {
            self.stats.skipped_frames += 1;
            Ok(FrameOutcome::Skipped)
        }
    }

    /// Runs one acquire / record / submit / present cycle.
    pub fn render_one_frame(&mut self, recorder: &mut impl FrameRecorder) -> Result<FrameOutcome> {
        let started = Instant::now();
        let mut timings = FrameTimings::default();

        if self.resize_pending || self.swapchain.is_none() || self.syncs.is_empty() {
            if !self.recreate(recorder)? {
                self.stats.skipped_frames += 1;
                return Ok(FrameOutcome::Skipped);
            }
        }

        let (swapchain, extent) = match self.swapchain.as_ref() {
            Some(swapchain) => (swapchain.handle, swapchain.extent),
            None => {
                return Err(RenderError::FrameAcquisitionFailed(
                    "no swapchain".to_string(),
                ))
            }
        };
        let frame = &self.syncs[self.current_frame];
        let image_available = frame.image_available;
        let render_finished = frame.render_finished;

        let acquire_timer = SectionTimer::accumulate("acquire", &mut timings.acquire);
        let (image_index, suboptimal) = match self.gpu.acquire_next_image(
            swapchain,
            image_available,
            self.config.acquire_timeout,
        )? {
            AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                debug!("[FrameSynchronizer] acquire reported out-of-date swapchain");
                self.stats.out_of_date_acquires += 1;
                return self.recreate_outcome(recorder);
            }
        };

        let Some(image) = self.syncs.get(image_index as usize) else {
            return Err(RenderError::FrameAcquisitionFailed(format!(
                "image index {image_index} out of range for {} frames",
                self.syncs.len()
            )));
        };
        let in_flight = image.in_flight;
        let command_buffer = image.command_buffer;

        if self.gpu.wait_fence(in_flight, self.config.fence_timeout)? == FenceStatus::TimedOut {
            error!(
                "[FrameSynchronizer] fence for image {image_index} not signalled after {:?}",
                self.config.fence_timeout
            );
            return Err(RenderError::GpuTimeout(format!(
                "in-flight fence for image {image_index} exceeded {:?}",
                self.config.fence_timeout
            )));
        }
        drop(acquire_timer);

        let image_view = self
            .swapchain
            .as_ref()
            .and_then(|swapchain| swapchain.image_views.get(image_index as usize).copied())
            .unwrap_or(ImageViewHandle::NULL);
        let ctx = FrameContext {
            command_buffer,
            image_index,
            frame_index: self.current_frame,
            extent,
            image_view,
        };

        {
            let _timer = SectionTimer::accumulate("record", &mut timings.record);
            self.gpu.reset_command_buffer(command_buffer)?;
            self.gpu.begin_command_buffer(command_buffer)?;
            recorder.record(&ctx)?;
            self.gpu.end_command_buffer(command_buffer)?;
        }

        {
            let _timer = SectionTimer::accumulate("submit", &mut timings.submit);
            // Reset only once a submission is certain, so an aborted frame cannot strand the fence.
            self.gpu.reset_fence(in_flight)?;
            self.gpu.submit(&SubmitDesc {
                command_buffer,
                wait: Some(image_available),
                signal: Some(render_finished),
                fence: Some(in_flight),
            })?;
        }
        self.stats.frames_submitted += 1;

        let presented = {
            let _timer = SectionTimer::accumulate("present", &mut timings.present);
            self.gpu.present(swapchain, image_index, render_finished)?
        };
        if presented != PresentOutcome::OutOfDate {
            self.stats.frames_presented += 1;
        }

        timings.total = started.elapsed();
        timings.log_summary(self.stats.frames_submitted);
        self.last_timings = timings;
        if self.budget.check(timings.total) {
            self.stats.over_budget_frames += 1;
        }

        if presented != PresentOutcome::Presented || suboptimal || self.resize_pending {
            debug!("[FrameSynchronizer] present reported {presented:?}; recreating");
            return self.recreate_outcome(recorder);
        }

        self.current_frame = (self.current_frame + 1) % self.syncs.len();
        Ok(FrameOutcome::Presented)
    }
}

impl<G: GpuResourceProvider> Drop for FrameSynchronizer<G> {
    fn drop(&mut self) {
        if let Err(err) = self.gpu.wait_idle() {
            error!("[FrameSynchronizer] wait_idle failed during teardown: {err}");
        }
        self.drop_sync_sets();
        if let Some(swapchain) = self.swapchain.take() {
            self.gpu.destroy_swapchain(swapchain.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuCall, RecordingBackend};

    fn noop(_: &FrameContext) -> Result<()> {
        Ok(())
    }

    #[test]
    fn frame_index_rotates_over_image_count() {
        let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(320, 240), 3));
        let mut sync = FrameSynchronizer::new(gpu, FrameConfig::default()).unwrap();
        let mut recorder = noop;
        for k in 1..=7 {
            assert_eq!(sync.render_one_frame(&mut recorder).unwrap(), FrameOutcome::Presented);
            assert_eq!(sync.current_frame(), k % 3);
        }
    }

    #[test]
    fn submission_waits_and_signals_current_semaphores() {
        let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(320, 240), 2));
        let mut sync = FrameSynchronizer::new(gpu.clone(), FrameConfig::default()).unwrap();
        let mut recorder = noop;
        sync.render_one_frame(&mut recorder).unwrap();

        let calls = gpu.calls();
        let acquired = calls.iter().find_map(|call| match call {
            GpuCall::Acquire { semaphore, .. } => Some(*semaphore),
            _ => None,
        });
        let submit = calls.iter().find_map(|call| match call {
            GpuCall::Submit(desc) => Some(*desc),
            _ => None,
        });
        let present_wait = calls.iter().find_map(|call| match call {
            GpuCall::Present { wait, .. } => Some(*wait),
            _ => None,
        });
        let submit = submit.unwrap();
        assert_eq!(submit.wait, acquired);
        assert_eq!(submit.signal, present_wait);
    }

    #[test]
    fn hung_gpu_is_reported_as_timeout() {
        let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(64, 64), 1));
        let config = FrameConfig {
            frames_in_flight: 1,
            ..FrameConfig::default()
        };
        let mut sync = FrameSynchronizer::new(gpu.clone(), config).unwrap();
        assert_eq!(sync.frames_in_flight(), 1);
        let mut recorder = noop;
        gpu.set_hang(true);
        sync.render_one_frame(&mut recorder).unwrap();
        assert!(matches!(
            sync.render_one_frame(&mut recorder),
            Err(RenderError::GpuTimeout(_))
        ));
    }

    #[test]
    fn zero_extent_surface_skips_frames() {
        let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(64, 64), 2));
        let mut sync = FrameSynchronizer::new(gpu.clone(), FrameConfig::default()).unwrap();
        let mut recorder = noop;
        gpu.set_surface(Extent2D::new(0, 0), 2);
        sync.request_resize();
        assert_eq!(sync.render_one_frame(&mut recorder).unwrap(), FrameOutcome::Skipped);
        assert!(sync.resize_pending());

        gpu.set_surface(Extent2D::new(128, 64), 2);
        assert_eq!(sync.render_one_frame(&mut recorder).unwrap(), FrameOutcome::Presented);
        assert_eq!(sync.swapchain().unwrap().extent, Extent2D::new(128, 64));
        assert_eq!(sync.stats().skipped_frames, 1);
    }

    #[test]
    fn timings_cover_the_submitted_frame() {
        let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(64, 64), 2));
        let mut sync = FrameSynchronizer::new(gpu, FrameConfig::default()).unwrap();
        let mut recorder = noop;
        sync.render_one_frame(&mut recorder).unwrap();
        let timings = sync.last_timings();
        assert!(timings.total >= timings.record);
        assert!(timings.total >= timings.acquire);
    }
}
