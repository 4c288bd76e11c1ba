use std::sync::Arc;

use penumbra::gpu::{
    BufferDesc, BufferHandle, BufferUsage, CommandBufferHandle, Extent2D, PipelineLayoutHandle,
    ShaderStages, SwapchainInfo,
};
use penumbra::*;

/// A mesh that only knows its buffers and index count.
struct Mesh {
    vertices: BufferHandle,
    indices: BufferHandle,
    index_count: u32,
    model: Mat4,
}

impl Drawable for Mesh {
    fn draw_geometry(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
    ) {
        recorder.bind_vertex_buffer(cmd, self.vertices, 0);
        recorder.bind_index_buffer(cmd, self.indices, 0);
        recorder.push_constants(
            cmd,
            layout,
            ShaderStages::Vertex,
            0,
            bytemuck::bytes_of(&self.model.to_cols_array()),
        );
        recorder.draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
    }
}

struct ForwardPass {
    frames: u64,
}

impl MainPass<RecordingBackend> for ForwardPass {
    fn record(
        &mut self,
        gpu: &RecordingBackend,
        ctx: &FrameContext,
        frame: &MainPassFrame<'_, RecordingBackend>,
    ) -> Result<()> {
        frame
            .shadows
            .bind(ctx.command_buffer, PipelineLayoutHandle::NULL, 1);
        for drawable in frame.drawables {
            drawable.draw_geometry(gpu, ctx.command_buffer, PipelineLayoutHandle::NULL);
        }
        self.frames += 1;
        Ok(())
    }

    fn rebuild(&mut self, _gpu: &RecordingBackend, swapchain: &SwapchainInfo) -> Result<()> {
        println!(
            "main pass targets rebuilt for {} images at {}x{}",
            swapchain.image_count(),
            swapchain.extent.width,
            swapchain.extent.height
        );
        Ok(())
    }
}

fn mesh(gpu: &RecordingBackend, model: Mat4) -> Result<Mesh> {
    let vertices = gpu.create_buffer(&BufferDesc {
        label: "vertices",
        size: 4 * 12,
        usage: BufferUsage::Vertex,
    })?;
    let indices = gpu.create_buffer(&BufferDesc {
        label: "indices",
        size: 6 * 4,
        usage: BufferUsage::Index,
    })?;
    Ok(Mesh {
        vertices,
        indices,
        index_count: 6,
        model,
    })
}

fn main() -> Result<()> {
    let gpu = Arc::new(RecordingBackend::with_surface(Extent2D::new(1280, 720), 3));
    let mut driver = FrameDriver::new(
        gpu.clone(),
        RendererConfig::default(),
        &ShadowShaders::default(),
        Box::new(ForwardPass { frames: 0 }),
    )?;

    let ground = mesh(&gpu, Mat4::from_scale(Vec3::new(20.0, 1.0, 20.0)))?;
    let crate_mesh = mesh(&gpu, Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0)))?;

    let lamp = driver
        .lights_mut()
        .create_point_light(Vec3::new(2.0, 3.0, 1.0), 5.0, 12.0, true);
    driver
        .lights_mut()
        .create_directional_light(Vec3::new(-0.3, -1.0, -0.4), 1.0, 4);

    let drawables: [&dyn Drawable; 2] = [&ground, &crate_mesh];
    for frame in 0..120u32 {
        if let Some(lamp) = lamp {
            let angle = frame as f32 * 0.05;
            let position = Vec3::new(3.0 * angle.cos(), 3.0, 3.0 * angle.sin());
            if let Err(err) = driver.lights_mut().set_position(lamp, position) {
                println!("lamp update rejected: {err:?}");
            }
        }
        if frame == 60 {
            gpu.set_surface(Extent2D::new(1920, 1080), 3);
            driver.request_resize();
        }
        driver.render_frame(&drawables)?;
    }

    println!("{:?}", driver.stats());
    for buffer in [ground.vertices, ground.indices, crate_mesh.vertices, crate_mesh.indices] {
        gpu.destroy_buffer(buffer);
    }
    Ok(())
}
