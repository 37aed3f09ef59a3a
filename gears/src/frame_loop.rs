use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Context;
use log::{info, warn};
use gears_rendergraph::{FrameInfo, RenderContext, RenderError, RenderGraph, Renderer, StalePolicy};
use gears_rhi::{RenderDevice, Swapchain};

/// Counters collected by one [`FrameLoop::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameLoopStats {
    pub frames: u64,
    pub recreates: u32,
    pub elapsed: Duration,
}

/// Owns everything needed to render and drives a draw callback until it asks
/// to stop.
pub struct FrameLoop<R, S> {
    device: Arc<dyn RenderDevice>,
    graph: RenderGraph,
    renderer: R,
    swapchain: S,

    frame_count: u64,
    last_time_printed: Instant,
}

impl<R: Renderer, S: Swapchain> FrameLoop<R, S> {
    pub fn new(device: Arc<dyn RenderDevice>, graph: RenderGraph, renderer: R, swapchain: S) -> Self {
        Self {
            device,
            graph,
            renderer,
            swapchain,
            frame_count: 0,
            last_time_printed: Instant::now(),
        }
    }

    /// Render until `draw` sets its stop flag.
    ///
    /// A stale swapchain is recreated in place when the renderer's config asks
    /// for [`StalePolicy::AutoRecreate`], every other error ends the loop. All
    /// submitted frames are finished before this returns.
    pub fn run<F>(&mut self, mut draw: F) -> anyhow::Result<FrameLoopStats>
    where
        F: FnMut(&mut RenderContext<'_>, &mut bool) -> Result<FrameInfo, RenderError>,
    {
        let started = Instant::now();
        let mut stats = FrameLoopStats::default();
        self.frame_count = 0;
        self.last_time_printed = started;

        let mut stop = false;
        while !stop {
            let rendered = {
                let mut context = RenderContext {
                    renderer: &mut self.renderer,
                    graph: &mut self.graph,
                    swapchain: &mut self.swapchain,
                };
                draw(&mut context, &mut stop)
            };

            match rendered {
                Ok(_) => {
                    stats.frames += 1;
                    self.tick();
                }
                Err(err) if err.is_stale() && self.renderer.config().stale == StalePolicy::AutoRecreate => {
                    warn!("Swapchain is stale, recreating it");
                    self.renderer
                        .recreate(&mut self.graph, &mut self.swapchain)
                        .context("Failed to recreate swapchain")?;
                    stats.recreates += 1;
                }
                Err(err) => {
                    if let Err(wait_err) = self.renderer.wait() {
                        warn!("Failed to wait for in-flight frames: {wait_err}");
                    }
                    return Err(err).context("Failed to render frame");
                }
            }

            profiling::finish_frame!();
        }

        self.renderer.wait().context("Failed to wait for in-flight frames")?;
        self.device.wait_idle().context("Failed to wait for device idle")?;

        stats.elapsed = started.elapsed();
        Ok(stats)
    }

    #[profiling::function]
    fn tick(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = (now - self.last_time_printed).as_secs_f32();
        if elapsed > 1. {
            info!("Frame rate: {} fps", self.frame_count as f32 / elapsed);
            self.last_time_printed = now;
            self.frame_count = 0;
        }
    }

    #[inline]
    pub fn graph(&self) -> &RenderGraph { &self.graph }

    #[inline]
    pub fn graph_mut(&mut self) -> &mut RenderGraph { &mut self.graph }

    #[inline]
    pub fn renderer(&self) -> &R { &self.renderer }

    #[inline]
    pub fn swapchain(&self) -> &S { &self.swapchain }

    #[inline]
    pub fn device(&self) -> &Arc<dyn RenderDevice> { &self.device }

    pub fn into_parts(self) -> (RenderGraph, R, S) {
        (self.graph, self.renderer, self.swapchain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rendergraph::{
        ConnectionSet, DrawDescriptor, GraphSettingsBuilder, Operation, RendererConfigBuilder, Resource,
        SwapchainImages, SynchronizedSwapchainRenderer,
    };
    use gears_rhi::headless::{HeadlessDevice, HeadlessSwapchain, HeadlessSwapchainConfig};
    use gears_rhi::{Extent2D, PipelineDescBuilder, ShaderBinary, ShaderProgram};

    fn frame_loop(stale: StalePolicy) -> FrameLoop<SynchronizedSwapchainRenderer, HeadlessSwapchain> {
        let device = Arc::new(HeadlessDevice::default());
        let swapchain = HeadlessSwapchain::new(device.clone(), HeadlessSwapchainConfig::default()).unwrap();

        let binary = ShaderBinary::from_words(vec![0x0723_0203]);
        let pipeline = PipelineDescBuilder::default()
            .name("clear")
            .program(ShaderProgram::Graphics { vertex: binary.clone(), fragment: binary })
            .build()
            .unwrap();
        let mut set = ConnectionSet::new();
        let present = set.add_resource(Resource::swapchain_image("present")).unwrap();
        let clear = set
            .add_operation(Operation::render("clear", pipeline, DrawDescriptor::fullscreen()).with_clear_color([0.2, 0.3, 0.8, 1.0]))
            .unwrap();
        set.add_output(clear, present, 0).unwrap();

        let frames = swapchain.image_count();
        let settings = GraphSettingsBuilder::default()
            .device(device.clone())
            .connection_set(set)
            .frames_in_flight(frames)
            .swapchain(SwapchainImages::of(&swapchain))
            .build()
            .unwrap();
        let mut graph = RenderGraph::new();
        graph.compile_resources(settings).unwrap();
        graph.compile().unwrap();

        let config = RendererConfigBuilder::default().stale(stale).build().unwrap();
        let renderer = SynchronizedSwapchainRenderer::new(device.clone(), frames as usize, &swapchain, config).unwrap();
        FrameLoop::new(device, graph, renderer, swapchain)
    }

    #[test]
    fn auto_recreate_survives_a_resize() {
        let mut frame_loop = frame_loop(StalePolicy::AutoRecreate);
        let control = frame_loop.swapchain().control();

        let mut calls = 0;
        let stats = frame_loop
            .run(|context, stop| {
                calls += 1;
                if calls == 3 {
                    control.resize(Extent2D::new(320, 200), 2);
                }
                *stop = calls >= 10;
                context.render_next_frame()
            })
            .unwrap();

        assert_eq!(stats.frames, 9);
        assert_eq!(stats.recreates, 1);
        assert_eq!(frame_loop.renderer().frames_in_flight(), 2);
        assert_eq!(frame_loop.graph().image_count(), 2);
        assert_eq!(control.presents().len(), 9);
    }

    #[test]
    fn stale_error_is_propagated_by_default() {
        let mut frame_loop = frame_loop(StalePolicy::Propagate);
        let control = frame_loop.swapchain().control();
        control.resize(Extent2D::new(320, 200), 2);

        let err = frame_loop.run(gears_rendergraph::infinite_draw_callback()).unwrap_err();
        assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::StaleSwapchain)));
        assert_eq!(control.recreate_count(), 0);
    }
}
