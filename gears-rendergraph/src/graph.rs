//! Compiled render graph: physical resources, pipelines and per-frame command buffers.

use std::sync::Arc;
use log::{debug, info, log_enabled, warn, Level};
use gears_core::collections::{hashmap::HashMap, SmallVec};
use gears_core::event::Event;
use gears_rhi::{
    CommandBufferHandle, CommandList, CommandPoolHandle, DeviceFeatures, FenceHandle, RenderDevice, SemaphoreHandle, SubmitInfo,
    Swapchain, TextureBarrier, TextureHandle, TextureLayout,
};
use crate::compiler::{execution_order, CompileContext};
use crate::connection::{ConnectionSet, OperationId, ResourceId};
use crate::error::{CompileError, RenderError};
use crate::pipeline_cache::PipelineCache;
use crate::resource::{Backing, Physical, Resource, ResourceKind};
use crate::settings::{GraphSettings, SwapchainImages};

/// Published through [`RenderGraph::compile_event`] after every successful compile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompileReport {
    pub frames_in_flight: usize,
    /// Swapchain images the command lists were recorded for; 1 without a swapchain resource.
    pub image_count: usize,
    pub operation_count: usize,
    pub command_list_count: usize,
}

/// Physical backing of one resource node, remembered so recompiles can keep it.
struct Allocation {
    kind: ResourceKind,
    backing: Backing,
}

struct CompiledFrames {
    pool: CommandPoolHandle,
    lists: Vec<CommandList>,
    command_buffers: Vec<CommandBufferHandle>,
    frames_in_flight: usize,
    image_count: usize,
}

impl CompiledFrames {
    fn index(&self, slot: usize, image_index: u32) -> Result<usize, RenderError> {
        if slot >= self.frames_in_flight {
            return Err(RenderError::SlotOutOfRange { slot, frames_in_flight: self.frames_in_flight });
        }
        // graphs without a swapchain resource render the same list into any image
        let image = if self.image_count == 1 { 0 } else { image_index as usize };
        if image >= self.image_count {
            return Err(RenderError::ImageOutOfRange { image_index, image_count: self.image_count });
        }
        Ok(slot * self.image_count + image)
    }
}

/// A graph compiled against a device.
///
/// `compile_resources` allocates physical backings, `compile` orders the
/// operations and records one command list per frame slot and swapchain image.
/// Both run again on recreate, reusing the topology held by the settings.
#[derive(Default)]
pub struct RenderGraph {
    settings: Option<GraphSettings>,
    device: Option<Arc<dyn RenderDevice>>,
    allocations: Vec<Option<Allocation>>,
    resources_compiled: bool,
    pipeline_cache: Option<PipelineCache>,
    frames: Option<CompiledFrames>,
    order: Vec<OperationId>,
    compile_event: Event<CompileReport>,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the physical resources for `settings`.
    ///
    /// Backings whose description and copy count did not change are kept,
    /// everything else is released. Newly created images are moved into their
    /// initial layout before this returns.
    #[profiling::function]
    pub fn compile_resources(&mut self, settings: GraphSettings) -> Result<(), CompileError> {
        self.resources_compiled = false;
        self.release_frames();

        let device = settings.device().clone();
        let device_changed = self
            .device
            .as_ref()
            .is_none_or(|old| !std::ptr::addr_eq(Arc::as_ptr(old), Arc::as_ptr(&device)));
        if device_changed {
            self.release_allocations();
            self.pipeline_cache = Some(PipelineCache::new(device.clone()));
            self.device = Some(device.clone());
        }

        // the old settings (and their command pool) go away only after the frames were freed
        self.settings = Some(settings);
        let Some(settings) = self.settings.as_ref() else {
            return Err(CompileError::ResourcesNotCompiled);
        };
        let set = settings.connection_set();
        set.validate()?;

        let frames_in_flight = settings.frames_in_flight();
        let features = device.features();
        // never shrunk, entries past the new node count are released below
        let mut previous = std::mem::take(&mut self.allocations);
        let mut allocations: Vec<Option<Allocation>> = Vec::new();
        allocations.resize_with(set.nodes().len(), || None);
        let mut fresh_textures = Vec::new();
        let (mut kept, mut created) = (0usize, 0usize);
        let mut failure = None;

        for (id, resource) in set.resources() {
            let kind = resource.kind();
            let copies = kind.copies(frames_in_flight) as usize;
            let slot = previous.get_mut(id.index()).filter(|_| kind != &ResourceKind::SwapchainImage);
            let reused = slot.and_then(|slot| {
                slot.take_if(|old| &old.kind == kind && old.backing.copy_count() == copies)
            });
            if let Some(reused) = reused {
                allocations[id.index()] = Some(reused);
                kept += 1;
                continue;
            }

            match allocate(device.as_ref(), resource, settings.swapchain(), frames_in_flight, features) {
                Ok((backing, textures)) => {
                    fresh_textures.extend(textures);
                    created += copies;
                    allocations[id.index()] = Some(Allocation { kind: kind.clone(), backing });
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        // whatever is left was not claimed by the new topology
        for allocation in previous.into_iter().flatten() {
            destroy_backing(device.as_ref(), &allocation.backing);
        }
        self.allocations = allocations;
        if let Some(err) = failure {
            return Err(err);
        }

        self.transition_to_initial_layouts(&fresh_textures)?;

        debug!("Render graph resources: {kept} kept, {created} copies allocated");
        self.resources_compiled = true;
        Ok(())
    }

    fn transition_to_initial_layouts(&self, textures: &[(TextureHandle, TextureLayout)]) -> Result<(), CompileError> {
        let (Some(settings), Some(device)) = (self.settings.as_ref(), self.device.as_ref()) else {
            return Err(CompileError::ResourcesNotCompiled);
        };
        let barriers: SmallVec<[TextureBarrier; 8]> = textures
            .iter()
            .filter(|(_, layout)| *layout != TextureLayout::Undefined)
            .map(|(texture, layout)| TextureBarrier::new(*texture, TextureLayout::Undefined, *layout))
            .collect();
        if barriers.is_empty() {
            return Ok(());
        }

        let mut list = CommandList::new("initial layouts");
        list.barriers(barriers, SmallVec::new());
        let pool = settings.command_pool()?;
        let command_buffer = device.create_command_buffer(pool, &list)?;
        let queue = settings.graphics_queue();
        let submitted = device
            .submit(queue, &SubmitInfo { command_buffers: &[command_buffer], ..Default::default() })
            .and_then(|_| device.wait_queue_idle(queue));
        device.free_command_buffer(pool, command_buffer);
        submitted?;
        Ok(())
    }

    /// Order, validate and record the graph. Requires [`Self::compile_resources`].
    #[profiling::function]
    pub fn compile(&mut self) -> Result<CompileReport, CompileError> {
        if !self.resources_compiled {
            return Err(CompileError::ResourcesNotCompiled);
        }
        self.release_frames();

        let (Some(settings), Some(device), Some(pipeline_cache)) =
            (self.settings.as_ref(), self.device.as_ref(), self.pipeline_cache.as_mut())
        else {
            return Err(CompileError::ResourcesNotCompiled);
        };
        let set = settings.connection_set();
        let backings: Vec<Option<Backing>> = self
            .allocations
            .iter()
            .map(|allocation| allocation.as_ref().map(|a| a.backing.clone()))
            .collect();
        let context = CompileContext {
            set,
            backings: &backings,
            swapchain: settings.swapchain(),
            features: device.features(),
        };

        let order = execution_order(set)?;
        for &id in &order.operations {
            if let Some(operation) = set.operation(id) {
                context.validate_operation(id, operation)?;
            }
        }

        let mut pipelines = HashMap::default();
        for &id in &order.operations {
            let Some(desc) = set.operation(id).and_then(|operation| context.pipeline_desc(id, operation)) else {
                continue;
            };
            pipelines.insert(id, pipeline_cache.get_or_create(&desc)?);
        }

        let frames_in_flight = settings.frames_in_flight() as usize;
        let image_count = if set.has_swapchain_resource() {
            settings.swapchain().map_or(1, SwapchainImages::image_count).max(1)
        } else {
            1
        };

        let mut lists = Vec::with_capacity(frames_in_flight * image_count);
        for slot in 0..frames_in_flight {
            for image in 0..image_count {
                lists.push(context.record(&order.operations, &pipelines, slot, image)?);
            }
        }

        if log_enabled!(Level::Debug) {
            debug!("Render graph:\n{}", context.dump(&order));
        }

        let pool = settings.command_pool()?;
        let mut command_buffers = Vec::with_capacity(lists.len());
        for list in &lists {
            match device.create_command_buffer(pool, list) {
                Ok(command_buffer) => command_buffers.push(command_buffer),
                Err(err) => {
                    for command_buffer in command_buffers {
                        device.free_command_buffer(pool, command_buffer);
                    }
                    return Err(err.into());
                }
            }
        }

        let report = CompileReport {
            frames_in_flight,
            image_count,
            operation_count: order.operations.len(),
            command_list_count: lists.len(),
        };
        info!(
            "Compiled render graph: {} operations, {} frames in flight, {} command lists",
            report.operation_count, report.frames_in_flight, report.command_list_count
        );

        self.order = order.operations;
        self.frames = Some(CompiledFrames { pool, lists, command_buffers, frames_in_flight, image_count });
        self.compile_event.notify(&report);
        Ok(report)
    }

    /// Move the settings out, adjust them and compile again with the same topology.
    pub fn recompile(
        &mut self,
        frames_in_flight: u32,
        swapchain: Option<SwapchainImages>,
    ) -> Result<CompileReport, CompileError> {
        let mut settings = self.settings.take().ok_or(CompileError::ResourcesNotCompiled)?;
        settings.set_frames_in_flight(frames_in_flight);
        if swapchain.is_some() {
            settings.set_swapchain(swapchain);
        }
        self.compile_resources(settings)?;
        self.compile()
    }

    /// Submit the command buffer of `slot` rendering into `image_index`.
    pub fn submit(
        &self,
        slot: usize,
        image_index: u32,
        wait_semaphores: &[SemaphoreHandle],
        signal_semaphores: &[SemaphoreHandle],
        fence: Option<FenceHandle>,
    ) -> Result<(), RenderError> {
        let (Some(frames), Some(settings), Some(device)) = (&self.frames, &self.settings, &self.device) else {
            return Err(RenderError::NotCompiled);
        };
        let command_buffer = frames.command_buffers[frames.index(slot, image_index)?];
        device.submit(
            settings.graphics_queue(),
            &SubmitInfo {
                command_buffers: &[command_buffer],
                wait_semaphores,
                signal_semaphores,
                fence,
            },
        )?;
        Ok(())
    }

    /// Present `image_index` once `wait_semaphores` are signalled.
    pub fn present(
        &self,
        swapchain: &mut dyn Swapchain,
        image_index: u32,
        wait_semaphores: &[SemaphoreHandle],
    ) -> Result<(), RenderError> {
        if !swapchain.supports_presenting() {
            return Err(RenderError::PresentingUnsupported);
        }
        swapchain.present(image_index, wait_semaphores)?;
        Ok(())
    }

    /// Write into the copy of a CPU buffer used by frame `slot`. The slot must
    /// not be in flight.
    pub fn write_cpu_buffer(&self, resource: ResourceId, slot: usize, offset: u64, data: &[u8]) -> Result<(), RenderError> {
        let (Some(settings), Some(device)) = (&self.settings, &self.device) else {
            return Err(RenderError::NotCompiled);
        };
        let node = settings
            .connection_set()
            .resource(resource)
            .ok_or(RenderError::NotCompiled)?;
        if !matches!(node.kind(), ResourceKind::CpuBuffer { .. }) {
            return Err(RenderError::NotCpuBuffer(node.name().to_owned()));
        }

        let frames_in_flight = settings.frames_in_flight() as usize;
        if slot >= frames_in_flight {
            return Err(RenderError::SlotOutOfRange { slot, frames_in_flight });
        }
        let buffer = self
            .backing(resource)
            .and_then(|backing| backing.resolve(slot, 0))
            .and_then(Physical::buffer)
            .ok_or(RenderError::NotCompiled)?;
        device.write_buffer(buffer, offset, data)?;
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.frames.is_some()
    }

    pub fn command_list(&self, slot: usize, image_index: u32) -> Option<&CommandList> {
        let frames = self.frames.as_ref()?;
        frames.lists.get(frames.index(slot, image_index).ok()?)
    }

    pub fn command_lists(&self) -> &[CommandList] {
        self.frames.as_ref().map_or(&[], |frames| frames.lists.as_slice())
    }

    pub fn command_buffer(&self, slot: usize, image_index: u32) -> Option<CommandBufferHandle> {
        let frames = self.frames.as_ref()?;
        frames.command_buffers.get(frames.index(slot, image_index).ok()?).copied()
    }

    /// Operations in the order they were recorded.
    pub fn operation_order(&self) -> &[OperationId] {
        &self.order
    }

    pub fn backing(&self, resource: ResourceId) -> Option<&Backing> {
        self.allocations.get(resource.index())?.as_ref().map(|allocation| &allocation.backing)
    }

    /// Frames in flight of the last compile, 0 before.
    pub fn frames_in_flight(&self) -> usize {
        self.frames.as_ref().map_or(0, |frames| frames.frames_in_flight)
    }

    pub fn image_count(&self) -> usize {
        self.frames.as_ref().map_or(0, |frames| frames.image_count)
    }

    pub fn settings(&self) -> Option<&GraphSettings> {
        self.settings.as_ref()
    }

    pub fn connection_set(&self) -> Option<&ConnectionSet> {
        self.settings.as_ref().map(GraphSettings::connection_set)
    }

    pub fn device(&self) -> Option<&Arc<dyn RenderDevice>> {
        self.device.as_ref()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipeline_cache.as_ref().map_or(0, PipelineCache::len)
    }

    pub fn compile_event(&self) -> &Event<CompileReport> {
        &self.compile_event
    }

    /// Free the recorded command buffers after the device finished with them.
    fn release_frames(&mut self) {
        let Some(frames) = self.frames.take() else {
            return;
        };
        let Some(device) = self.device.as_ref() else {
            return;
        };
        if let Err(err) = device.wait_idle() {
            warn!("Failed to wait for the device before releasing command buffers: {err}");
        }
        for command_buffer in frames.command_buffers {
            device.free_command_buffer(frames.pool, command_buffer);
        }
    }

    fn release_allocations(&mut self) {
        let Some(device) = self.device.as_ref() else {
            self.allocations.clear();
            return;
        };
        for allocation in self.allocations.drain(..).flatten() {
            destroy_backing(device.as_ref(), &allocation.backing);
        }
    }
}

/// Create the physical copies of one resource. Returns the new textures with
/// the layout they have to be moved into before first use.
fn allocate(
    device: &dyn RenderDevice,
    resource: &Resource,
    swapchain: Option<&SwapchainImages>,
    frames_in_flight: u32,
    features: DeviceFeatures,
) -> Result<(Backing, Vec<(TextureHandle, TextureLayout)>), CompileError> {
    let kind = resource.kind();
    if let ResourceKind::SwapchainImage = kind {
        let swapchain = swapchain.ok_or_else(|| CompileError::MissingSwapchain(resource.name().to_owned()))?;
        return Ok((Backing::Swapchain(swapchain.images.clone()), Vec::new()));
    }
    if kind.image_desc().is_some_and(|desc| desc.extent.depth > 1) && !features.texture_3d {
        return Err(CompileError::MissingFeature { node: resource.name().to_owned(), feature: "texture_3d" });
    }

    let mut copies = Vec::new();
    let mut textures = Vec::new();
    for copy in 0..kind.copies(frames_in_flight) {
        let created = if let Some(desc) = kind.texture_desc(resource.name(), copy, features) {
            device.create_texture(&desc).map(|texture| {
                textures.push((texture, kind.initial_layout()));
                Physical::Texture(texture)
            })
        } else if let Some(desc) = kind.buffer_desc(resource.name(), copy) {
            device.create_buffer(&desc).map(Physical::Buffer)
        } else {
            continue;
        };
        match created {
            Ok(physical) => copies.push(physical),
            Err(err) => {
                destroy_backing(device, &Backing::Multi(copies));
                return Err(err.into());
            }
        }
    }

    let backing = match (kind.is_per_frame(), copies.pop()) {
        (false, Some(single)) => Backing::Single(single),
        (false, None) => Backing::Multi(Vec::new()),
        (true, last) => {
            copies.extend(last);
            Backing::Multi(copies)
        }
    };
    Ok((backing, textures))
}

fn destroy_backing(device: &dyn RenderDevice, backing: &Backing) {
    for physical in backing.owned() {
        match physical {
            Physical::Texture(texture) => device.destroy_texture(texture),
            Physical::Buffer(buffer) => device.destroy_buffer(buffer),
        }
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        self.release_frames();
        self.release_allocations();
        if let Some(mut cache) = self.pipeline_cache.take() {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::headless::HeadlessDevice;
    use gears_rhi::{Command, Format, PipelineDescBuilder, ShaderBinary, ShaderProgram};
    use crate::operation::{DrawDescriptor, Operation};
    use crate::resource::{ImageDesc, Resource};
    use crate::settings::GraphSettingsBuilder;

    fn draw(name: &str) -> Operation {
        let binary = ShaderBinary::from_words(vec![0x0723_0203]);
        let pipeline = PipelineDescBuilder::default()
            .name(name)
            .program(ShaderProgram::Graphics { vertex: binary.clone(), fragment: binary })
            .build()
            .unwrap();
        Operation::render(name, pipeline, DrawDescriptor::fullscreen())
    }

    fn settings(device: &Arc<HeadlessDevice>, set: ConnectionSet, frames: u32) -> GraphSettings {
        GraphSettingsBuilder::default()
            .device(device.clone())
            .connection_set(set)
            .frames_in_flight(frames)
            .build()
            .unwrap()
    }

    #[test]
    fn compile_requires_resources() {
        let mut graph = RenderGraph::new();
        assert!(matches!(graph.compile(), Err(CompileError::ResourcesNotCompiled)));
    }

    #[test]
    fn multi_resources_get_one_copy_per_frame() {
        let device = Arc::new(HeadlessDevice::default());
        let mut set = ConnectionSet::new();
        let target = set
            .add_resource(Resource::writable_image("target", ImageDesc::new_2d(16, 16, Format::Rgba8Unorm)))
            .unwrap();
        let single = set
            .add_resource(Resource::single_writable_image("single", ImageDesc::new_2d(16, 16, Format::Rgba8Unorm)))
            .unwrap();
        let op = set.add_operation(draw("draw")).unwrap();
        set.add_output(op, target, 0).unwrap();
        set.add_output(op, single, 1).unwrap();

        let mut graph = RenderGraph::new();
        graph.compile_resources(settings(&device, set, 3)).unwrap();
        let report = graph.compile().unwrap();

        assert_eq!(graph.backing(target).map(Backing::copy_count), Some(3));
        assert!(matches!(graph.backing(single), Some(Backing::Single(_))));
        assert_eq!(report.command_list_count, 3);
        assert_eq!(device.live_texture_count(), 4);

        let list = graph.command_list(1, 0).unwrap();
        assert!(list.iter().any(|command| matches!(command, Command::Draw(_))));

        drop(graph);
        assert_eq!(device.live_texture_count(), 0);
        assert_eq!(device.live_command_buffer_count(), 0);
        assert_eq!(device.live_pipeline_count(), 0);
    }

    #[test]
    fn unchanged_backings_survive_recompile() {
        let device = Arc::new(HeadlessDevice::default());
        let mut set = ConnectionSet::new();
        let target = set
            .add_resource(Resource::writable_image("target", ImageDesc::new_2d(16, 16, Format::Rgba8Unorm)))
            .unwrap();
        let op = set.add_operation(draw("draw")).unwrap();
        set.add_output(op, target, 0).unwrap();

        let mut graph = RenderGraph::new();
        graph.compile_resources(settings(&device, set, 2)).unwrap();
        graph.compile().unwrap();
        let before = graph.backing(target).cloned();

        graph.recompile(2, None).unwrap();
        assert_eq!(graph.backing(target).cloned(), before);

        graph.recompile(3, None).unwrap();
        assert_eq!(graph.backing(target).map(Backing::copy_count), Some(3));
        assert_eq!(device.live_texture_count(), 3);
        assert_eq!(graph.pipeline_count(), 1);
    }

    #[test]
    fn compile_event_reports_each_compile() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let device = Arc::new(HeadlessDevice::default());
        let mut set = ConnectionSet::new();
        let target = set
            .add_resource(Resource::writable_image("target", ImageDesc::new_2d(4, 4, Format::Rgba8Unorm)))
            .unwrap();
        let op = set.add_operation(draw("draw")).unwrap();
        set.add_output(op, target, 0).unwrap();

        let mut graph = RenderGraph::new();
        let compiles = Arc::new(AtomicUsize::new(0));
        let counter = compiles.clone();
        let _subscription = graph.compile_event().subscribe(move |report: &CompileReport| {
            assert_eq!(report.operation_count, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        graph.compile_resources(settings(&device, set, 1)).unwrap();
        graph.compile().unwrap();
        graph.recompile(1, None).unwrap();
        assert_eq!(compiles.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn swapchain_resource_needs_images() {
        let device = Arc::new(HeadlessDevice::default());
        let mut set = ConnectionSet::new();
        set.add_resource(Resource::swapchain_image("present")).unwrap();

        let mut graph = RenderGraph::new();
        let err = graph.compile_resources(settings(&device, set, 1)).unwrap_err();
        assert!(matches!(err, CompileError::MissingSwapchain(name) if name == "present"));
    }

    #[test]
    fn cpu_buffers_are_written_per_slot() {
        let device = Arc::new(HeadlessDevice::default());
        let mut set = ConnectionSet::new();
        let uniforms = set.add_resource(Resource::cpu_buffer("uniforms", 8)).unwrap();
        let target = set
            .add_resource(Resource::writable_image("target", ImageDesc::new_2d(4, 4, Format::Rgba8Unorm)))
            .unwrap();

        let mut graph = RenderGraph::new();
        graph.compile_resources(settings(&device, set, 2)).unwrap();

        graph.write_cpu_buffer(uniforms, 1, 4, &[1, 2, 3, 4]).unwrap();
        let copy = graph.backing(uniforms).and_then(|b| b.resolve(1, 0)).and_then(Physical::buffer).unwrap();
        assert_eq!(device.buffer_contents(copy).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);

        assert!(matches!(graph.write_cpu_buffer(uniforms, 2, 0, &[0]), Err(RenderError::SlotOutOfRange { .. })));
        assert!(matches!(graph.write_cpu_buffer(target, 0, 0, &[0]), Err(RenderError::NotCpuBuffer(_))));
    }
}
