use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info, LevelFilter};
use parking_lot::Mutex;
use gears::rendergraph::{
    BindingMeta, ConnectionSet, DrawDescriptor, FrameEvent, GraphSettingsBuilder, ImageDesc, Operation, RenderGraph,
    Renderer, RendererConfigBuilder, Resource, ResourceId, StalePolicy, SwapchainImages,
    SynchronizedSwapchainRenderer,
};
use gears::rhi::headless::{HeadlessDevice, HeadlessSwapchain, HeadlessSwapchainConfigBuilder};
use gears::rhi::{
    BindingKind, BindingSlot, Extent2D, Format, PipelineDesc, PipelineDescBuilder, RenderDevice, ShaderBinary,
    ShaderProgram, ShaderStage, Swapchain,
};
use gears::FrameLoop;

const FRAMES: u32 = 120;
const RESIZE_AT: u32 = 40;

/// Header of an empty SPIR-V module, enough for the headless device.
const SHADER_HEADER: [u32; 5] = [0x0723_0203, 0x0001_0600, 0, 1, 0];

fn graphics_pipeline(name: &str, bindings: Vec<BindingSlot>) -> anyhow::Result<PipelineDesc> {
    let binary = ShaderBinary::from_words(SHADER_HEADER.to_vec());
    Ok(PipelineDescBuilder::default()
        .name(name)
        .program(ShaderProgram::Graphics { vertex: binary.clone(), fragment: binary })
        .bindings(bindings)
        .build()?)
}

/// Scene pass renders into an offscreen image driven by per-frame parameters,
/// tonemap samples it into the swapchain image.
#[profiling::function]
fn build_graph() -> anyhow::Result<(ConnectionSet, ResourceId)> {
    let mut set = ConnectionSet::new();
    let params = set.add_resource(Resource::cpu_buffer("params", 16))?;
    let scene = set.add_resource(Resource::writable_image("scene", ImageDesc::new_2d(640, 480, Format::Rgba16Float)))?;
    let present = set.add_resource(Resource::swapchain_image("present"))?;

    let scene_pass = set.add_operation(
        Operation::render(
            "scene pass",
            graphics_pipeline("scene pass", vec![BindingSlot::new(0, BindingKind::UniformBuffer, ShaderStage::Fragment)])?,
            DrawDescriptor::new(3, 1),
        )
        .with_clear_color([0.0, 0.0, 0.0, 1.0]),
    )?;
    let tonemap = set.add_operation(Operation::render(
        "tonemap",
        graphics_pipeline("tonemap", vec![BindingSlot::new(0, BindingKind::SampledTexture, ShaderStage::Fragment)])?,
        DrawDescriptor::fullscreen(),
    ))?;

    set.add_input(params, scene_pass, BindingMeta::new(0))?;
    set.add_output(scene_pass, scene, 0)?;
    set.add_input(scene, tonemap, 0)?;
    set.add_output(tonemap, present, 0)?;

    Ok((set, params))
}

fn main() -> anyhow::Result<()> {
    gears::core::log::initialize(LevelFilter::Info)?;

    let device = Arc::new(HeadlessDevice::default());
    let swapchain = HeadlessSwapchain::new(
        device.clone(),
        HeadlessSwapchainConfigBuilder::default().image_count(3u32).build()?,
    )?;
    let control = swapchain.control();
    info!("Swapchain: {} images of {}", swapchain.image_count(), swapchain.extent());

    let (set, params) = build_graph()?;
    let frames_in_flight = swapchain.image_count();
    let settings = GraphSettingsBuilder::default()
        .device(device.clone())
        .connection_set(set)
        .frames_in_flight(frames_in_flight)
        .swapchain(SwapchainImages::of(&swapchain))
        .build()?;

    let mut graph = RenderGraph::new();
    let _compiled = graph.compile_event().subscribe(|report| {
        info!("Graph compiled into {} command lists", report.command_list_count);
    });
    graph.compile_resources(settings)?;
    graph.compile()?;

    let config = RendererConfigBuilder::default().stale(StalePolicy::AutoRecreate).build()?;
    let renderer = SynchronizedSwapchainRenderer::new(device.clone(), frames_in_flight as usize, &swapchain, config)?;

    let fence_wait = Arc::new(Mutex::new(Duration::ZERO));
    let _fence_timing = {
        let fence_wait = fence_wait.clone();
        let mut started = None;
        renderer.frame_events().subscribe(move |event| match event {
            FrameEvent::FenceWaitStarted { .. } => started = Some(Instant::now()),
            FrameEvent::FenceWaitEnded { .. } => {
                if let Some(started) = started.take() {
                    *fence_wait.lock() += started.elapsed();
                }
            }
            _ => {}
        })
    };
    let _recreated = renderer.recreate_event().subscribe(|report| {
        info!("Renderer now drives {} frames in flight at {}", report.frames_in_flight, report.extent);
    });

    let mut frame_loop = FrameLoop::new(device.clone(), graph, renderer, swapchain);
    let mut frame = 0u32;
    let stats = frame_loop.run(|context, stop| {
        frame += 1;
        if frame == RESIZE_AT {
            control.resize(Extent2D::new(800, 600), 2);
        }
        *stop = frame >= FRAMES;

        context.render_next_frame_with(&mut |graph, pre_submit| {
            debug!("Frame {frame}: slot {} image {}", pre_submit.slot, pre_submit.image_index);
            let time = frame as f32 / 60.0;
            let mut bytes = Vec::with_capacity(16);
            for value in [time, time.sin(), time.cos(), pre_submit.since_last_draw.as_secs_f32()] {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            graph.write_cpu_buffer(params, pre_submit.slot, 0, &bytes)
        })
    })?;

    info!(
        "Rendered {} frames in {:?} with {} recreate(s), {} presents",
        stats.frames,
        stats.elapsed,
        stats.recreates,
        control.presents().len()
    );
    info!(
        "Submissions: {}, most fences outstanding at once: {}, time waiting on fences: {:?}",
        device.submission_count(),
        device.max_outstanding_fences(),
        *fence_wait.lock()
    );
    info!("Device: {}", device.name());

    Ok(())
}
