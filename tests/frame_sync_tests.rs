use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use penumbra::frame::SyncState;
use penumbra::gpu::{
    AcquireOutcome, Extent2D, GpuCall, PipelineLayoutHandle, PresentOutcome, SwapchainInfo,
};
use penumbra::light::GpuPointLight;
use penumbra::{
    Drawable, FrameConfig, FrameContext, FrameDriver, FrameOutcome, FrameRecorder,
    FrameSynchronizer, MainPass, MainPassFrame, RecordingBackend, RendererConfig, Result,
    ShadowShaders, Vec3,
};

#[derive(Default)]
struct CountingRecorder {
    recorded: Vec<FrameContext>,
    rebuilds: u32,
}

impl FrameRecorder for CountingRecorder {
    fn record(&mut self, ctx: &FrameContext) -> Result<()> {
        self.recorded.push(*ctx);
        Ok(())
    }

    fn rebuild(&mut self, _swapchain: &SwapchainInfo) -> Result<()> {
        self.rebuilds += 1;
        Ok(())
    }
}

fn synchronizer(images: u32) -> (Arc<RecordingBackend>, FrameSynchronizer<RecordingBackend>) {
    let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(640, 480), images));
    let sync = FrameSynchronizer::new(gpu.clone(), FrameConfig::default()).expect("synchronizer");
    (gpu, sync)
}

fn submissions(gpu: &RecordingBackend) -> usize {
    gpu.count_calls(|call| matches!(call, GpuCall::Submit(_)))
}

#[test]
fn out_of_date_acquire_rebuilds_once_without_submitting() {
    let (gpu, mut sync) = synchronizer(3);
    let mut recorder = CountingRecorder::default();

    for _ in 0..4 {
        assert_eq!(
            sync.render_one_frame(&mut recorder).unwrap(),
            FrameOutcome::Presented
        );
    }
    assert_eq!(sync.current_frame(), 1);

    gpu.script_acquire(AcquireOutcome::OutOfDate);
    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Recreated
    );
    assert_eq!(recorder.rebuilds, 1);
    assert_eq!(recorder.recorded.len(), 4);
    assert_eq!(submissions(&gpu), 4);
    assert_eq!(sync.current_frame(), 0);
    assert_eq!(sync.state(), SyncState::Running);

    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(recorder.rebuilds, 1);
    assert_eq!(submissions(&gpu), 5);

    let stats = sync.stats();
    assert_eq!(stats.recreations, 1);
    assert_eq!(stats.out_of_date_acquires, 1);
    assert_eq!(stats.frames_submitted, 5);
    assert_eq!(
        gpu.count_calls(|call| matches!(call, GpuCall::CreateSwapchain { .. })),
        2
    );
}

#[test]
fn recreated_swapchain_retires_the_old_one() {
    let (gpu, mut sync) = synchronizer(2);
    let mut recorder = CountingRecorder::default();
    let first = sync.swapchain().unwrap().handle;

    sync.request_resize();
    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Presented
    );

    let old = gpu.calls().into_iter().find_map(|call| match call {
        GpuCall::CreateSwapchain { old: Some(old), .. } => Some(old),
        _ => None,
    });
    assert_eq!(old, Some(first));
    assert!(!gpu.is_live(first.0));
    assert_ne!(sync.swapchain().unwrap().handle, first);
}

#[test]
fn suboptimal_present_still_counts_and_then_rebuilds() {
    let (gpu, mut sync) = synchronizer(3);
    let mut recorder = CountingRecorder::default();
    gpu.script_present(PresentOutcome::Suboptimal);

    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Recreated
    );
    let stats = sync.stats();
    assert_eq!(stats.frames_presented, 1);
    assert_eq!(stats.recreations, 1);
    assert_eq!(recorder.rebuilds, 1);
}

#[test]
fn out_of_date_present_is_not_counted_as_presented() {
    let (gpu, mut sync) = synchronizer(3);
    let mut recorder = CountingRecorder::default();
    gpu.script_present(PresentOutcome::OutOfDate);

    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Recreated
    );
    assert_eq!(sync.stats().frames_submitted, 1);
    assert_eq!(sync.stats().frames_presented, 0);
}

#[test]
fn fence_and_command_buffer_follow_the_acquired_image() {
    let (gpu, mut sync) = synchronizer(3);
    let mut recorder = CountingRecorder::default();
    for _ in 0..6 {
        sync.render_one_frame(&mut recorder).unwrap();
    }

    let calls = gpu.calls();
    let waits: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            GpuCall::WaitFence { fence } => Some(*fence),
            _ => None,
        })
        .collect();
    let submits: Vec<_> = calls
        .iter()
        .filter_map(|call| match call {
            GpuCall::Submit(desc) => Some(*desc),
            _ => None,
        })
        .collect();

    assert_eq!(waits.len(), 6);
    for (wait, submit) in waits.iter().zip(&submits) {
        assert_eq!(submit.fence, Some(*wait));
    }
    for (ctx, submit) in recorder.recorded.iter().zip(&submits) {
        assert_eq!(ctx.command_buffer, submit.command_buffer);
    }
    // Image k and image k + 3 share their fence.
    assert_eq!(waits[0], waits[3]);
    assert_ne!(waits[0], waits[1]);
}

#[test]
fn recorder_failure_leaves_fence_signalled() {
    let (gpu, mut sync) = synchronizer(1);
    let mut failing = |_: &FrameContext| -> Result<()> {
        Err(penumbra::RenderError::RecordingFailed("boom".to_string()))
    };
    assert!(sync.render_one_frame(&mut failing).is_err());
    assert_eq!(submissions(&gpu), 0);

    let mut recorder = CountingRecorder::default();
    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Presented
    );
}

struct FailingRebuild;

impl FrameRecorder for FailingRebuild {
    fn record(&mut self, _ctx: &FrameContext) -> Result<()> {
        Ok(())
    }

    fn rebuild(&mut self, _swapchain: &SwapchainInfo) -> Result<()> {
        Err(penumbra::RenderError::RecordingFailed("pipelines".to_string()))
    }
}

#[test]
fn failed_rebuild_keeps_the_swapchain_and_retries() {
    let (gpu, mut sync) = synchronizer(2);
    let mut recorder = CountingRecorder::default();
    sync.render_one_frame(&mut recorder).unwrap();

    gpu.set_surface(Extent2D::new(800, 600), 2);
    sync.request_resize();
    assert!(matches!(
        sync.render_one_frame(&mut FailingRebuild),
        Err(penumbra::RenderError::RecordingFailed(_))
    ));
    assert_eq!(sync.state(), SyncState::Running);
    assert!(sync.resize_pending());
    let kept = sync.swapchain().expect("swapchain kept").handle;
    assert!(gpu.is_live(kept.0));

    assert_eq!(
        sync.render_one_frame(&mut recorder).unwrap(),
        FrameOutcome::Presented
    );
    assert!(!sync.resize_pending());
    assert!(!gpu.is_live(kept.0));
    assert_eq!(sync.swapchain().unwrap().extent, Extent2D::new(800, 600));
    assert_eq!(sync.stats().recreations, 1);

    drop(sync);
    assert_eq!(gpu.live_count(), 0);
}

#[test]
fn dropping_the_synchronizer_releases_everything() {
    let (gpu, mut sync) = synchronizer(3);
    let mut recorder = CountingRecorder::default();
    sync.render_one_frame(&mut recorder).unwrap();
    drop(sync);
    assert_eq!(gpu.live_count(), 0);
}

struct Counters {
    records: AtomicU32,
    rebuilds: AtomicU32,
}

struct SamplingPass {
    counters: Arc<Counters>,
}

impl MainPass<RecordingBackend> for SamplingPass {
    fn record(
        &mut self,
        _gpu: &RecordingBackend,
        ctx: &FrameContext,
        frame: &MainPassFrame<'_, RecordingBackend>,
    ) -> Result<()> {
        frame
            .shadows
            .bind(ctx.command_buffer, PipelineLayoutHandle::NULL, 1);
        self.counters.records.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rebuild(&mut self, _gpu: &RecordingBackend, _swapchain: &SwapchainInfo) -> Result<()> {
        self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn driver_runs_shadows_and_main_pass_each_frame() {
    let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(800, 600), 3));
    let counters = Arc::new(Counters {
        records: AtomicU32::new(0),
        rebuilds: AtomicU32::new(0),
    });
    let mut driver = FrameDriver::new(
        gpu.clone(),
        RendererConfig::default(),
        &ShadowShaders::default(),
        Box::new(SamplingPass {
            counters: counters.clone(),
        }),
    )
    .expect("driver");
    assert_eq!(counters.rebuilds.load(Ordering::Relaxed), 1);

    let lamp = driver
        .lights_mut()
        .create_point_light(Vec3::new(1.0, 2.0, 3.0), 4.0, 8.0, true)
        .expect("point light");
    driver
        .lights_mut()
        .create_directional_light(Vec3::new(-0.2, -1.0, -0.1), 1.0, 4)
        .expect("sun");

    let drawables: [&dyn Drawable; 0] = [];
    for _ in 0..5 {
        assert_eq!(
            driver.render_frame(&drawables).unwrap(),
            FrameOutcome::Presented
        );
    }
    assert_eq!(counters.records.load(Ordering::Relaxed), 5);
    assert_eq!(driver.stats().frames_presented, 5);

    let buffers = driver.light_uniforms().buffers(0).unwrap();
    let bytes = gpu.buffer_contents(buffers.point).unwrap();
    let slot = usize::from(lamp.index()) * std::mem::size_of::<GpuPointLight>();
    let packed: GpuPointLight =
        bytemuck::pod_read_unaligned(&bytes[slot..slot + std::mem::size_of::<GpuPointLight>()]);
    assert_eq!(packed.position, [1.0, 2.0, 3.0]);
    assert_eq!(packed.brightness, 4.0);
    assert_eq!(packed.shadow_index, 0);

    let sun = driver.lights().directional_lights().next().unwrap().1;
    assert_eq!(sun.cascade_splits.w, driver.camera().far);
}

#[test]
fn driver_follows_resizes_and_cleans_up() {
    let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(800, 600), 3));
    let counters = Arc::new(Counters {
        records: AtomicU32::new(0),
        rebuilds: AtomicU32::new(0),
    });
    let mut driver = FrameDriver::new(
        gpu.clone(),
        RendererConfig {
            frames: FrameConfig {
                frames_in_flight: 2,
                ..FrameConfig::default()
            },
            ..RendererConfig::default()
        },
        &ShadowShaders::default(),
        Box::new(SamplingPass {
            counters: counters.clone(),
        }),
    )
    .expect("driver");
    driver.render_frame(&[]).unwrap();

    gpu.set_surface(Extent2D::new(1024, 512), 2);
    driver.request_resize();
    assert_eq!(driver.render_frame(&[]).unwrap(), FrameOutcome::Presented);

    assert_eq!(counters.rebuilds.load(Ordering::Relaxed), 2);
    assert_eq!(driver.light_uniforms().len(), 2);
    assert_eq!(driver.camera().aspect, 2.0);
    assert_eq!(
        driver.synchronizer().swapchain().unwrap().extent,
        Extent2D::new(1024, 512)
    );

    drop(driver);
    assert_eq!(gpu.live_count(), 0);
}
