//! Frame drivers: acquire, submit and present a compiled [`RenderGraph`].

use std::sync::Arc;
use std::time::{Duration, Instant};
use derive_builder::Builder;
use log::{info, trace, warn};
use gears_core::event::Event;
use gears_rhi::{Extent2D, Fence, RenderDevice, Semaphore, Swapchain};
use crate::error::RenderError;
use crate::graph::RenderGraph;
use crate::settings::SwapchainImages;

/// Step boundaries of a frame, published for instrumentation only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    FenceWaitStarted { slot: usize },
    FenceWaitEnded { slot: usize },
    AcquisitionStarted,
    AcquisitionReturned { image_index: u32 },
    AcquisitionFenceSignaled { image_index: u32 },
    AcquisitionEnded { slot: usize, image_index: u32 },
    RenderStarted { slot: usize, image_index: u32 },
    PresentStarted { slot: usize, image_index: u32 },
}

/// Sent right before a frame is submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreSubmit {
    pub slot: usize,
    pub image_index: u32,
    /// Zero for the first frame after construction or recreate.
    pub since_last_draw: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecreateReport {
    pub image_count: u32,
    pub frames_in_flight: usize,
    pub extent: Extent2D,
}

/// Slot and swapchain image a frame was rendered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub slot: usize,
    pub image_index: u32,
}

/// How long the CPU waits on a fence before giving up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WaitPolicy {
    /// `None` waits forever.
    pub fence_timeout: Option<Duration>,
}

impl WaitPolicy {
    pub fn bounded(timeout: Duration) -> Self {
        Self { fence_timeout: Some(timeout) }
    }
}

/// What the frame loop does when a renderer reports a stale swapchain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StalePolicy {
    /// Hand the error to the caller.
    #[default]
    Propagate,
    /// Recreate swapchain and graph, then carry on with the next frame.
    AutoRecreate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Builder)]
#[builder(default)]
pub struct RendererConfig {
    pub wait: WaitPolicy,
    pub stale: StalePolicy,
}

/// Per-frame hook running after the slot is free and before it is submitted.
/// This is the place to write per-frame CPU buffers.
pub type FrameUpdate<'a> = dyn FnMut(&RenderGraph, &PreSubmit) -> Result<(), RenderError> + 'a;

pub trait Renderer {
    /// Render one frame, calling `update` once the frame's resources are free.
    fn render_next_frame_with(
        &mut self,
        graph: &mut RenderGraph,
        swapchain: &mut dyn Swapchain,
        update: &mut FrameUpdate<'_>,
    ) -> Result<FrameInfo, RenderError>;

    fn render_next_frame(&mut self, graph: &mut RenderGraph, swapchain: &mut dyn Swapchain) -> Result<FrameInfo, RenderError> {
        self.render_next_frame_with(graph, swapchain, &mut |_, _| Ok(()))
    }

    /// Rebuild the swapchain, recompile `graph` for the new images and reset
    /// the frame state. Does nothing harmful when nothing changed.
    fn recreate(&mut self, graph: &mut RenderGraph, swapchain: &mut dyn Swapchain) -> Result<RecreateReport, RenderError>;

    /// Block until no submitted frame is outstanding.
    fn wait(&self) -> Result<(), RenderError>;

    fn config(&self) -> &RendererConfig;

    fn frames_in_flight(&self) -> usize;

    fn frame_events(&self) -> &Event<FrameEvent>;

    fn pre_submit_event(&self) -> &Event<PreSubmit>;

    fn recreate_event(&self) -> &Event<RecreateReport>;
}

/// Wait for the device, recreate the swapchain and recompile the graph with
/// one frame in flight per swapchain image.
fn recreate_swapchain_and_graph(
    device: &dyn RenderDevice,
    graph: &mut RenderGraph,
    swapchain: &mut dyn Swapchain,
) -> Result<RecreateReport, RenderError> {
    device.wait_idle()?;
    swapchain.recreate()?;

    let image_count = swapchain.image_count();
    graph.recompile(image_count, Some(SwapchainImages::of(&*swapchain)))?;

    let report = RecreateReport {
        image_count,
        frames_in_flight: graph.frames_in_flight(),
        extent: swapchain.extent(),
    };
    info!("Recreated swapchain: {} images of {}", report.image_count, report.extent);
    Ok(report)
}

struct FrameSync {
    image_available: Semaphore,
    render_finished: Semaphore,
    in_flight: Fence,
}

impl FrameSync {
    fn new(device: &Arc<dyn RenderDevice>, slot: usize) -> Result<Self, RenderError> {
        Ok(Self {
            image_available: Semaphore::new(&format!("Image available #{slot}"), device)?,
            render_finished: Semaphore::new(&format!("Render finished #{slot}"), device)?,
            // signalled so the first wait on every slot returns immediately
            in_flight: Fence::new(&format!("In flight #{slot}"), device, true)?,
        })
    }
}

/// Keeps up to `frames_in_flight` frames queued on the GPU.
///
/// A slot's command buffer and resources are only reused after the fence of
/// the slot's previous submission signalled, and a swapchain image is only
/// rendered into after the frame that used it last has finished.
pub struct SynchronizedSwapchainRenderer {
    device: Arc<dyn RenderDevice>,
    config: RendererConfig,
    frames: Vec<FrameSync>,
    acquire_fence: Fence,
    image_to_frame: Vec<Option<usize>>,
    current_slot: usize,
    stale: bool,
    last_draw: Option<Instant>,

    frame_events: Event<FrameEvent>,
    pre_submit_event: Event<PreSubmit>,
    recreate_event: Event<RecreateReport>,
}

impl SynchronizedSwapchainRenderer {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        frames_in_flight: usize,
        swapchain: &dyn Swapchain,
        config: RendererConfig,
    ) -> Result<Self, RenderError> {
        let frames = Self::create_frames(&device, frames_in_flight.max(1))?;
        let acquire_fence = Fence::new("Image acquired", &device, false)?;
        Ok(Self {
            device,
            config,
            frames,
            acquire_fence,
            image_to_frame: vec![None; swapchain.image_count() as usize],
            current_slot: 0,
            stale: false,
            last_draw: None,
            frame_events: Event::new(),
            pre_submit_event: Event::new(),
            recreate_event: Event::new(),
        })
    }

    fn create_frames(device: &Arc<dyn RenderDevice>, count: usize) -> Result<Vec<FrameSync>, RenderError> {
        (0..count).map(|slot| FrameSync::new(device, slot)).collect()
    }

    /// Slot the next frame will use.
    #[inline]
    pub fn current_slot(&self) -> usize { self.current_slot }

    /// `true` after acquire or present reported a stale swapchain, until [`Renderer::recreate`].
    #[inline]
    pub fn is_stale(&self) -> bool { self.stale }

    pub fn in_flight_fence(&self, slot: usize) -> Option<&Fence> {
        self.frames.get(slot).map(|frame| &frame.in_flight)
    }

    /// Slot that last rendered into swapchain image `image_index`.
    pub fn frame_of_image(&self, image_index: u32) -> Option<usize> {
        self.image_to_frame.get(image_index as usize).copied().flatten()
    }

    fn emit(&self, event: FrameEvent) {
        trace!("{event:?}");
        self.frame_events.notify(&event);
    }

    fn mark_stale(&mut self, err: RenderError) -> RenderError {
        if err.is_stale() {
            warn!("Swapchain went stale, frames are refused until it is recreated");
            self.stale = true;
        }
        err
    }

    /// Everything between a successful acquire and the queue submit of one frame.
    fn submit_acquired(
        &mut self,
        graph: &mut RenderGraph,
        slot: usize,
        image_index: u32,
        update: &mut FrameUpdate<'_>,
    ) -> Result<(), RenderError> {
        let timeout = self.config.wait.fence_timeout;
        self.acquire_fence.wait(timeout)?;
        self.emit(FrameEvent::AcquisitionFenceSignaled { image_index });
        self.acquire_fence.reset()?;

        let image = image_index as usize;
        let image_count = self.image_to_frame.len();
        let previous = *self
            .image_to_frame
            .get(image)
            .ok_or(RenderError::ImageOutOfRange { image_index, image_count })?;
        if let Some(previous) = previous {
            if previous != slot {
                // the image is still owned by another slot's submission
                let other = self
                    .frames
                    .get(previous)
                    .ok_or(RenderError::SlotMappingBroken { image_index, slot: previous })?;
                other.in_flight.wait(timeout)?;
            }
        }
        self.emit(FrameEvent::AcquisitionEnded { slot, image_index });

        let now = Instant::now();
        let pre_submit = PreSubmit {
            slot,
            image_index,
            since_last_draw: self.last_draw.map_or(Duration::ZERO, |last| now.duration_since(last)),
        };
        self.last_draw = Some(now);
        update(graph, &pre_submit)?;
        self.pre_submit_event.notify(&pre_submit);

        let frame = &self.frames[slot];
        frame.in_flight.reset()?;
        self.emit(FrameEvent::RenderStarted { slot, image_index });
        let submitted = graph.submit(
            slot,
            image_index,
            &[frame.image_available.handle()],
            &[frame.render_finished.handle()],
            Some(frame.in_flight.handle()),
        );
        if let Err(err) = submitted {
            // nothing was queued, the reset fence would never signal again
            self.frames[slot].in_flight = Fence::new(&format!("In flight #{slot}"), &self.device, true)?;
            return Err(err);
        }
        self.image_to_frame[image] = Some(slot);
        Ok(())
    }

    /// An image was acquired but never submitted. It can not be presented and
    /// the slot's acquire semaphore stays signalled, so only a recreate gets
    /// the swapchain back into a usable state.
    fn abandon_frame(&mut self, slot: usize, image_index: u32, err: RenderError) -> RenderError {
        warn!("Abandoned frame in slot {slot} after acquiring image {image_index}, recreate before the next frame: {err}");
        self.stale = true;
        err
    }
}

impl Renderer for SynchronizedSwapchainRenderer {
    #[profiling::function]
    fn render_next_frame_with(
        &mut self,
        graph: &mut RenderGraph,
        swapchain: &mut dyn Swapchain,
        update: &mut FrameUpdate<'_>,
    ) -> Result<FrameInfo, RenderError> {
        if self.stale {
            return Err(RenderError::StaleSwapchain);
        }
        if !swapchain.supports_presenting() {
            return Err(RenderError::PresentingUnsupported);
        }
        if !graph.is_compiled() {
            return Err(RenderError::NotCompiled);
        }
        if graph.frames_in_flight() != self.frames.len() {
            return Err(RenderError::FrameCountMismatch {
                renderer: self.frames.len(),
                graph: graph.frames_in_flight(),
            });
        }

        let slot = self.current_slot;

        self.emit(FrameEvent::FenceWaitStarted { slot });
        self.frames[slot].in_flight.wait(self.config.wait.fence_timeout)?;
        self.emit(FrameEvent::FenceWaitEnded { slot });

        self.emit(FrameEvent::AcquisitionStarted);
        let acquired = swapchain.acquire_next_image(
            Some(self.frames[slot].image_available.handle()),
            Some(self.acquire_fence.handle()),
        );
        let image_index = match acquired {
            Ok(image_index) => image_index,
            Err(err) => return Err(self.mark_stale(err.into())),
        };
        self.emit(FrameEvent::AcquisitionReturned { image_index });

        if let Err(err) = self.submit_acquired(graph, slot, image_index, update) {
            return Err(self.abandon_frame(slot, image_index, err));
        }

        self.emit(FrameEvent::PresentStarted { slot, image_index });
        let presented = graph.present(swapchain, image_index, &[self.frames[slot].render_finished.handle()]);
        self.current_slot = (slot + 1) % self.frames.len();

        match presented {
            Ok(()) => Ok(FrameInfo { slot, image_index }),
            Err(err) => Err(self.mark_stale(err)),
        }
    }

    fn recreate(&mut self, graph: &mut RenderGraph, swapchain: &mut dyn Swapchain) -> Result<RecreateReport, RenderError> {
        let report = recreate_swapchain_and_graph(self.device.as_ref(), graph, swapchain)?;

        // semaphores may still be signalled by an acquire that reported stale
        self.frames = Self::create_frames(&self.device, report.frames_in_flight)?;
        self.acquire_fence = Fence::new("Image acquired", &self.device, false)?;
        self.image_to_frame = vec![None; report.image_count as usize];
        self.current_slot = 0;
        self.stale = false;
        self.last_draw = None;

        self.recreate_event.notify(&report);
        Ok(report)
    }

    fn wait(&self) -> Result<(), RenderError> {
        for frame in &self.frames {
            frame.in_flight.wait(self.config.wait.fence_timeout)?;
        }
        Ok(())
    }

    fn config(&self) -> &RendererConfig { &self.config }

    fn frames_in_flight(&self) -> usize { self.frames.len() }

    fn frame_events(&self) -> &Event<FrameEvent> { &self.frame_events }

    fn pre_submit_event(&self) -> &Event<PreSubmit> { &self.pre_submit_event }

    fn recreate_event(&self) -> &Event<RecreateReport> { &self.recreate_event }
}

/// Renders one frame at a time and waits for the device after each step.
/// Also drives swapchains that can not present.
pub struct BlockingRenderer {
    device: Arc<dyn RenderDevice>,
    config: RendererConfig,
    image_available: Semaphore,
    stale: bool,
    last_draw: Option<Instant>,

    frame_events: Event<FrameEvent>,
    pre_submit_event: Event<PreSubmit>,
    recreate_event: Event<RecreateReport>,
}

impl BlockingRenderer {
    pub fn new(device: Arc<dyn RenderDevice>, config: RendererConfig) -> Result<Self, RenderError> {
        let image_available = Semaphore::new("Image available", &device)?;
        Ok(Self {
            device,
            config,
            image_available,
            stale: false,
            last_draw: None,
            frame_events: Event::new(),
            pre_submit_event: Event::new(),
            recreate_event: Event::new(),
        })
    }

    fn mark_stale(&mut self, err: RenderError) -> RenderError {
        if err.is_stale() {
            warn!("Swapchain went stale, frames are refused until it is recreated");
            self.stale = true;
        }
        err
    }
}

impl Renderer for BlockingRenderer {
    #[profiling::function]
    fn render_next_frame_with(
        &mut self,
        graph: &mut RenderGraph,
        swapchain: &mut dyn Swapchain,
        update: &mut FrameUpdate<'_>,
    ) -> Result<FrameInfo, RenderError> {
        if self.stale {
            return Err(RenderError::StaleSwapchain);
        }
        let frames_in_flight = graph.frames_in_flight();
        let Some(queue) = graph.settings().map(|settings| settings.graphics_queue()) else {
            return Err(RenderError::NotCompiled);
        };
        if frames_in_flight == 0 {
            return Err(RenderError::NotCompiled);
        }

        self.frame_events.notify(&FrameEvent::AcquisitionStarted);
        let image_index = match swapchain.acquire_next_image(Some(self.image_available.handle()), None) {
            Ok(image_index) => image_index,
            Err(err) => return Err(self.mark_stale(err.into())),
        };
        self.frame_events.notify(&FrameEvent::AcquisitionReturned { image_index });

        let slot = image_index as usize % frames_in_flight;
        self.frame_events.notify(&FrameEvent::AcquisitionEnded { slot, image_index });

        let now = Instant::now();
        let pre_submit = PreSubmit {
            slot,
            image_index,
            since_last_draw: self.last_draw.map_or(Duration::ZERO, |last| now.duration_since(last)),
        };
        self.last_draw = Some(now);
        let submitted = update(graph, &pre_submit).and_then(|_| {
            self.pre_submit_event.notify(&pre_submit);
            self.frame_events.notify(&FrameEvent::RenderStarted { slot, image_index });
            graph.submit(slot, image_index, &[self.image_available.handle()], &[], None)
        });
        if let Err(err) = submitted {
            // the acquire semaphore is still signalled and the image is never presented
            warn!("Abandoned frame after acquiring image {image_index}, recreate before the next frame: {err}");
            self.stale = true;
            return Err(err);
        }
        self.device.wait_queue_idle(queue)?;
        self.device.wait_idle()?;

        if swapchain.supports_presenting() {
            self.frame_events.notify(&FrameEvent::PresentStarted { slot, image_index });
            // the queue is idle, so presenting needs no semaphore
            if let Err(err) = graph.present(swapchain, image_index, &[]) {
                return Err(self.mark_stale(err));
            }
            self.device.wait_idle()?;
        }

        Ok(FrameInfo { slot, image_index })
    }

    fn recreate(&mut self, graph: &mut RenderGraph, swapchain: &mut dyn Swapchain) -> Result<RecreateReport, RenderError> {
        let report = recreate_swapchain_and_graph(self.device.as_ref(), graph, swapchain)?;
        self.image_available = Semaphore::new("Image available", &self.device)?;
        self.stale = false;
        self.last_draw = None;
        self.recreate_event.notify(&report);
        Ok(report)
    }

    fn wait(&self) -> Result<(), RenderError> {
        self.device.wait_idle()?;
        Ok(())
    }

    fn config(&self) -> &RendererConfig { &self.config }

    fn frames_in_flight(&self) -> usize { 1 }

    fn frame_events(&self) -> &Event<FrameEvent> { &self.frame_events }

    fn pre_submit_event(&self) -> &Event<PreSubmit> { &self.pre_submit_event }

    fn recreate_event(&self) -> &Event<RecreateReport> { &self.recreate_event }
}

/// Everything a draw callback needs to render a frame.
pub struct RenderContext<'a> {
    pub renderer: &'a mut dyn Renderer,
    pub graph: &'a mut RenderGraph,
    pub swapchain: &'a mut dyn Swapchain,
}

impl RenderContext<'_> {
    pub fn render_next_frame(&mut self) -> Result<FrameInfo, RenderError> {
        self.renderer.render_next_frame(self.graph, self.swapchain)
    }

    pub fn render_next_frame_with(&mut self, update: &mut FrameUpdate<'_>) -> Result<FrameInfo, RenderError> {
        self.renderer.render_next_frame_with(self.graph, self.swapchain, update)
    }
}

/// Renders a frame on every call and never asks to stop.
pub fn infinite_draw_callback() -> impl FnMut(&mut RenderContext<'_>, &mut bool) -> Result<FrameInfo, RenderError> {
    |context: &mut RenderContext<'_>, _stop: &mut bool| context.render_next_frame()
}

/// Sets the stop flag from `should_stop`, then renders the frame.
pub fn conditional_draw_callback<F>(mut should_stop: F) -> impl FnMut(&mut RenderContext<'_>, &mut bool) -> Result<FrameInfo, RenderError>
where
    F: FnMut() -> bool,
{
    move |context: &mut RenderContext<'_>, stop: &mut bool| {
        *stop = should_stop();
        context.render_next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::headless::{HeadlessDevice, HeadlessSwapchain, HeadlessSwapchainConfig};

    #[test]
    fn config_builder_defaults() {
        let config = RendererConfigBuilder::default().build().unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.stale, StalePolicy::Propagate);
        assert_eq!(config.wait.fence_timeout, None);

        let bounded = RendererConfigBuilder::default()
            .wait(WaitPolicy::bounded(Duration::from_millis(5)))
            .build()
            .unwrap();
        assert_eq!(bounded.wait.fence_timeout, Some(Duration::from_millis(5)));
    }

    #[test]
    fn uncompiled_graph_is_refused() {
        let device = Arc::new(HeadlessDevice::default());
        let mut swapchain = HeadlessSwapchain::new(device.clone(), HeadlessSwapchainConfig::default()).unwrap();
        let mut renderer =
            SynchronizedSwapchainRenderer::new(device.clone(), 2, &swapchain, RendererConfig::default()).unwrap();
        let mut graph = RenderGraph::new();

        let err = renderer.render_next_frame(&mut graph, &mut swapchain).unwrap_err();
        assert!(matches!(err, RenderError::NotCompiled));
        // nothing was acquired
        assert!(swapchain.control().acquisitions().is_empty());
        assert_eq!(renderer.current_slot(), 0);
    }

    #[test]
    fn offscreen_swapchain_needs_blocking_renderer() {
        let device = Arc::new(HeadlessDevice::default());
        let config = HeadlessSwapchainConfig::offscreen(Extent2D::new(4, 4), gears_rhi::Format::Rgba8Unorm);
        let mut swapchain = HeadlessSwapchain::new(device.clone(), config).unwrap();
        let mut renderer =
            SynchronizedSwapchainRenderer::new(device.clone(), 1, &swapchain, RendererConfig::default()).unwrap();

        let err = renderer.render_next_frame(&mut RenderGraph::new(), &mut swapchain).unwrap_err();
        assert!(matches!(err, RenderError::PresentingUnsupported));
    }

    #[test]
    fn sync_objects_are_released() {
        let device = Arc::new(HeadlessDevice::default());
        let swapchain = HeadlessSwapchain::new(device.clone(), HeadlessSwapchainConfig::default()).unwrap();
        let renderer = SynchronizedSwapchainRenderer::new(device.clone(), 3, &swapchain, RendererConfig::default()).unwrap();
        assert_eq!(device.live_fence_count(), 4);
        assert_eq!(device.live_semaphore_count(), 6);
        assert_eq!(renderer.frames_in_flight(), 3);

        drop(renderer);
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(device.live_semaphore_count(), 0);
    }
}
