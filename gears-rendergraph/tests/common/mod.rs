#![allow(dead_code)]

use std::sync::Arc;
use gears_rendergraph::{
    CompileError, ConnectionSet, DrawDescriptor, GraphSettingsBuilder, ImageDesc, Operation, OperationId, RenderGraph, Resource,
    ResourceId, SwapchainImages,
};
use gears_rhi::headless::{DeviceEvent, HeadlessDevice, HeadlessSwapchain, HeadlessSwapchainConfig, HeadlessSwapchainConfigBuilder};
use gears_rhi::{
    BindingKind, BindingSlot, Command, CommandList, FenceHandle, PipelineDesc, PipelineDescBuilder, ShaderBinary,
    ShaderProgram, ShaderStage, Swapchain, TextureHandle,
};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

pub fn graphics_pipeline(name: &str, bindings: Vec<BindingSlot>) -> PipelineDesc {
    let binary = ShaderBinary::from_words(vec![SPIRV_MAGIC]);
    PipelineDescBuilder::default()
        .name(name)
        .program(ShaderProgram::Graphics { vertex: binary.clone(), fragment: binary })
        .bindings(bindings)
        .build()
        .unwrap()
}

pub fn compute_pipeline(name: &str, bindings: Vec<BindingSlot>) -> PipelineDesc {
    PipelineDescBuilder::default()
        .name(name)
        .program(ShaderProgram::Compute(ShaderBinary::from_words(vec![SPIRV_MAGIC])))
        .bindings(bindings)
        .build()
        .unwrap()
}

pub fn sampled(binding: u32) -> BindingSlot {
    BindingSlot::new(binding, BindingKind::SampledTexture, ShaderStage::Fragment)
}

pub fn draw(name: &str) -> Operation {
    Operation::render(name, graphics_pipeline(name, Vec::new()), DrawDescriptor::fullscreen())
}

pub fn swapchain(device: &Arc<HeadlessDevice>, image_count: u32) -> HeadlessSwapchain {
    let config = HeadlessSwapchainConfigBuilder::default().image_count(image_count).build().unwrap();
    HeadlessSwapchain::new(device.clone(), config).unwrap()
}

pub fn scripted_swapchain(device: &Arc<HeadlessDevice>, image_count: u32, order: Vec<u32>) -> HeadlessSwapchain {
    let config = HeadlessSwapchainConfigBuilder::default()
        .image_count(image_count)
        .acquire_order(gears_rhi::headless::AcquireOrder::Scripted(order))
        .build()
        .unwrap();
    HeadlessSwapchain::new(device.clone(), config).unwrap()
}

pub fn offscreen_swapchain(device: &Arc<HeadlessDevice>) -> HeadlessSwapchain {
    let config = HeadlessSwapchainConfig::offscreen(gears_rhi::Extent2D::new(640, 480), gears_rhi::Format::Rgba8Unorm);
    HeadlessSwapchain::new(device.clone(), config).unwrap()
}

/// Ids of the nodes of [`presenting_set`].
pub struct PresentingNodes {
    pub present: ResourceId,
    pub history: ResourceId,
    pub operation: OperationId,
}

/// One render operation writing the swapchain image and a second image of the
/// same size.
pub fn presenting_set() -> (ConnectionSet, PresentingNodes) {
    let mut set = ConnectionSet::new();
    let present = set.add_resource(Resource::swapchain_image("present")).unwrap();
    let history = set
        .add_resource(Resource::writable_image("history", ImageDesc::new_2d(640, 480, gears_rhi::Format::Rgba8Unorm)))
        .unwrap();
    let operation = set.add_operation(draw("pattern").with_clear_color([0.0, 0.0, 0.0, 1.0])).unwrap();
    set.add_output(operation, present, 0).unwrap();
    set.add_output(operation, history, 1).unwrap();
    (set, PresentingNodes { present, history, operation })
}

/// One render operation writing only the swapchain image.
pub fn swapchain_only_set() -> ConnectionSet {
    let mut set = ConnectionSet::new();
    let present = set.add_resource(Resource::swapchain_image("present")).unwrap();
    let operation = set.add_operation(draw("pattern")).unwrap();
    set.add_output(operation, present, 0).unwrap();
    set
}

pub fn try_compile(
    device: &Arc<HeadlessDevice>,
    set: ConnectionSet,
    frames_in_flight: u32,
    swapchain: Option<&dyn Swapchain>,
) -> Result<RenderGraph, CompileError> {
    let mut builder = GraphSettingsBuilder::default();
    builder.device(device.clone()).connection_set(set).frames_in_flight(frames_in_flight);
    if let Some(swapchain) = swapchain {
        builder.swapchain(SwapchainImages::of(swapchain));
    }
    let mut graph = RenderGraph::new();
    graph.compile_resources(builder.build().unwrap())?;
    graph.compile()?;
    Ok(graph)
}

pub fn compile(
    device: &Arc<HeadlessDevice>,
    set: ConnectionSet,
    frames_in_flight: u32,
    swapchain: Option<&dyn Swapchain>,
) -> RenderGraph {
    try_compile(device, set, frames_in_flight, swapchain).unwrap()
}

pub fn fence_of(event: &DeviceEvent) -> Option<FenceHandle> {
    match event {
        DeviceEvent::Submitted { fence, .. } => *fence,
        _ => None,
    }
}

pub fn submissions(events: &[DeviceEvent]) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, event)| matches!(event, DeviceEvent::Submitted { .. }))
        .map(|(position, _)| position)
        .collect()
}

pub fn has_texture_barrier(list: &CommandList, range: std::ops::Range<usize>, texture: TextureHandle) -> bool {
    list.commands()[range].iter().any(|command| match command {
        Command::Barrier { textures, .. } => textures.iter().any(|barrier| barrier.texture == texture),
        _ => false,
    })
}
