use std::sync::Arc;

use penumbra::gpu::{
    CommandBufferHandle, CommandRecorder, Extent2D, GpuCall, GpuResourceProvider, ImageLayout,
    PipelineLayoutHandle, ShaderStages,
};
use penumbra::shadow::{ShadowMapState, MODEL_PUSH_SIZE};
use penumbra::{
    CameraState, CascadeCalculator, Drawable, LightCapacity, LightRegistry, Mat4,
    RecordingBackend, ShadowCaster, ShadowSettings, ShadowShaders, Vec3,
};

struct Quad;

impl Drawable for Quad {
    fn draw_geometry(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
    ) {
        recorder.push_constants(
            cmd,
            layout,
            ShaderStages::Vertex,
            0,
            bytemuck::bytes_of(&Mat4::IDENTITY.to_cols_array()),
        );
        recorder.draw_indexed(cmd, 6, 1, 0, 0, 0);
    }
}

fn capacity() -> LightCapacity {
    LightCapacity {
        point_lights: 4,
        point_shadows: 2,
        directional_lights: 2,
        directional_shadows: 2,
    }
}

fn caster(gpu: &Arc<RecordingBackend>) -> ShadowCaster<RecordingBackend> {
    ShadowCaster::new(
        gpu.clone(),
        capacity(),
        ShadowSettings::performance(),
        &ShadowShaders::default(),
    )
    .expect("shadow caster")
}

/// Two shadowed point lights, one shadowless point light, one sun with three cascades.
fn scene() -> LightRegistry {
    let mut lights = LightRegistry::new(capacity());
    lights.create_point_light(Vec3::new(0.0, 2.0, 0.0), 1.0, 10.0, true);
    lights.create_point_light(Vec3::new(4.0, 2.0, 0.0), 1.0, 10.0, true);
    lights.create_point_light(Vec3::new(-4.0, 2.0, 0.0), 1.0, 10.0, false);
    lights.create_directional_light(Vec3::new(-0.3, -1.0, -0.2), 1.0, 3);
    lights.update_cascades(&CameraState::default(), &CascadeCalculator::default());
    lights
}

fn begin_passes_at(gpu: &RecordingBackend, size: u32) -> usize {
    gpu.count_calls(|call| {
        matches!(call, GpuCall::BeginRenderPass { extent, .. } if *extent == Extent2D::square(size))
    })
}

#[test]
fn one_pass_per_point_light_and_per_cascade() {
    let gpu = Arc::new(RecordingBackend::new());
    let mut shadows = caster(&gpu);
    let lights = scene();
    let cmd = gpu.allocate_command_buffer().unwrap();
    gpu.clear_calls();

    shadows.cast(cmd, &lights, &[&Quad, &Quad]);

    let settings = ShadowSettings::performance();
    assert_eq!(begin_passes_at(&gpu, settings.point_resolution), 2);
    assert_eq!(begin_passes_at(&gpu, settings.directional_resolution), 3);
    assert_eq!(
        gpu.count_calls(|call| matches!(call, GpuCall::EndRenderPass { .. })),
        5
    );
    // Every pass draws every drawable once.
    assert_eq!(
        gpu.count_calls(|call| matches!(call, GpuCall::DrawIndexed { .. })),
        10
    );
}

#[test]
fn light_data_is_pushed_after_the_model_matrix() {
    let gpu = Arc::new(RecordingBackend::new());
    let mut shadows = caster(&gpu);
    let lights = scene();
    let cmd = gpu.allocate_command_buffer().unwrap();
    gpu.clear_calls();

    shadows.cast(cmd, &lights, &[&Quad]);

    let light_pushes: Vec<Vec<u8>> = gpu
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GpuCall::PushConstants { offset, data, .. } if offset == MODEL_PUSH_SIZE => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(light_pushes.len(), 5);

    let (_, sun) = lights.directional_lights().next().unwrap();
    for (cascade, data) in light_pushes[2..].iter().enumerate() {
        let expected = sun.cascade_view_proj[cascade].to_cols_array();
        assert_eq!(data.as_slice(), bytemuck::bytes_of(&expected));
    }
}

#[test]
fn directional_maps_end_readable_and_transitions_cover_active_cascades() {
    let gpu = Arc::new(RecordingBackend::new());
    let mut shadows = caster(&gpu);
    let lights = scene();
    let cmd = gpu.allocate_command_buffer().unwrap();
    gpu.clear_calls();

    shadows.cast(cmd, &lights, &[&Quad]);

    let (_, sun) = lights.directional_lights().next().unwrap();
    let slot = sun.shadow_slot.unwrap().as_usize();
    assert_eq!(shadows.directional_state(slot), Some(ShadowMapState::Readable));
    assert_eq!(shadows.directional_state(1 - slot), Some(ShadowMapState::Unused));

    let image = shadows.directional_map(slot).unwrap().image;
    let to_readable: Vec<_> = gpu
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GpuCall::TransitionImage { transition, .. }
                if transition.image == image && transition.from == ImageLayout::DepthAttachment =>
            {
                Some(transition)
            }
            _ => None,
        })
        .collect();
    assert_eq!(to_readable.len(), 1);
    assert_eq!(to_readable[0].to, ImageLayout::ShaderReadOnly);
    assert_eq!(to_readable[0].layer_count, 3);
    assert!(to_readable[0].depth);
}

#[test]
fn first_cast_initialises_every_map_layout_once() {
    let gpu = Arc::new(RecordingBackend::new());
    let mut shadows = caster(&gpu);
    let lights = LightRegistry::new(capacity());
    let cmd = gpu.allocate_command_buffer().unwrap();
    gpu.clear_calls();

    let from_undefined = |gpu: &RecordingBackend| {
        gpu.count_calls(|call| {
            matches!(
                call,
                GpuCall::TransitionImage { transition, .. }
                    if transition.from == ImageLayout::Undefined
            )
        })
    };

    shadows.cast(cmd, &lights, &[]);
    assert_eq!(from_undefined(&gpu), 4);
    assert_eq!(
        gpu.count_calls(|call| matches!(call, GpuCall::BeginRenderPass { .. })),
        0
    );

    gpu.clear_calls();
    shadows.cast(cmd, &lights, &[]);
    assert_eq!(from_undefined(&gpu), 0);
}

#[test]
fn removed_lights_stop_casting() {
    let gpu = Arc::new(RecordingBackend::new());
    let mut shadows = caster(&gpu);
    let mut lights = scene();
    let cmd = gpu.allocate_command_buffer().unwrap();

    let handles: Vec<_> = lights.point_lights().map(|(handle, _)| handle).collect();
    for handle in handles {
        lights.remove_light(handle);
    }
    gpu.clear_calls();
    shadows.cast(cmd, &lights, &[&Quad]);

    assert_eq!(
        begin_passes_at(&gpu, ShadowSettings::performance().point_resolution),
        0
    );
    assert_eq!(
        begin_passes_at(&gpu, ShadowSettings::performance().directional_resolution),
        3
    );
}

#[test]
fn bind_uses_the_sampling_set() {
    let gpu = Arc::new(RecordingBackend::new());
    let mut shadows = caster(&gpu);
    let lights = scene();
    let cmd = gpu.allocate_command_buffer().unwrap();
    shadows.cast(cmd, &lights, &[&Quad]);
    gpu.clear_calls();

    shadows.bind(cmd, PipelineLayoutHandle(1), 2);
    let calls = gpu.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        calls[0],
        GpuCall::BindDescriptorSet { set_index: 2, .. }
    ));
    assert_eq!(shadows.sampling_layout().bindings.len(), 2);
    assert_eq!(shadows.sampling_layout().bindings[0].count, 2);
}

#[test]
fn drop_releases_every_gpu_object() {
    let gpu = Arc::new(RecordingBackend::new());
    let shadows = caster(&gpu);
    assert_eq!(shadows.point_map_count(), 2);
    assert_eq!(shadows.directional_map_count(), 2);
    assert!(gpu.live_count() > 0);
    drop(shadows);
    assert_eq!(gpu.live_count(), 0);
}

#[test]
fn failed_construction_releases_partial_resources() {
    let mut failures = 0;
    for budget in 0..200 {
        let gpu = Arc::new(RecordingBackend::new());
        gpu.fail_creation_after(budget);
        match ShadowCaster::new(
            gpu.clone(),
            capacity(),
            ShadowSettings::default(),
            &ShadowShaders::default(),
        ) {
            Ok(_) => break,
            Err(_) => {
                failures += 1;
                assert_eq!(gpu.live_count(), 0, "leak after {budget} creations");
            }
        }
    }
    assert!(failures > 0);
}
