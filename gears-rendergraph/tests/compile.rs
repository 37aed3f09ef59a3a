mod common;

use std::sync::Arc;
use gears_rendergraph::{
    BindingMeta, CompileError, ConnectionSet, DrawDescriptor, GraphError, GraphSettingsBuilder, ImageDesc, Operation,
    Resource, SwapchainImages,
};
use gears_rhi::headless::{HeadlessDevice, HeadlessDeviceConfig};
use gears_rhi::{
    BindingKind, BindingSlot, BoundResource, BufferBarrier, BufferState, Command, DeviceFeatures, Format, ShaderStage,
    TextureBarrier, TextureLayout,
};
use common::*;

fn image(width: u32, height: u32) -> ImageDesc {
    ImageDesc::new_2d(width, height, Format::Rgba8Unorm)
}

fn sampling(name: &str) -> Operation {
    Operation::render(name, graphics_pipeline(name, vec![sampled(0)]), DrawDescriptor::fullscreen())
}

#[test]
fn writers_record_before_readers_in_any_insertion_order() {
    for reader_first in [false, true] {
        let device = Arc::new(HeadlessDevice::default());
        let swapchain = swapchain(&device, 2);

        let mut set = ConnectionSet::new();
        let scene = set.add_resource(Resource::writable_image("scene", image(640, 480))).unwrap();
        let present = set.add_resource(Resource::swapchain_image("present")).unwrap();
        let (writer, reader) = if reader_first {
            let reader = set.add_operation(sampling("post")).unwrap();
            (set.add_operation(draw("scene pass")).unwrap(), reader)
        } else {
            let writer = set.add_operation(draw("scene pass")).unwrap();
            (writer, set.add_operation(sampling("post")).unwrap())
        };
        set.add_output(writer, scene, 0).unwrap();
        set.add_input(scene, reader, 0).unwrap();
        set.add_output(reader, present, 0).unwrap();

        let graph = compile(&device, set, 2, Some(&swapchain));
        assert_eq!(graph.operation_order(), [writer, reader]);

        let scene_texture = graph.backing(scene).unwrap().resolve(0, 0).unwrap().texture().unwrap();
        let list = graph.command_list(0, 0).unwrap();
        let writer_at = list.operation_position("scene pass").unwrap();
        let reader_at = list.operation_position("post").unwrap();
        assert!(writer_at < reader_at);

        let Command::Barrier { textures, .. } = &list.commands()[reader_at + 1] else {
            panic!("\"post\" does not start with a barrier:\n{list}");
        };
        assert!(textures.contains(&TextureBarrier::new(
            scene_texture,
            TextureLayout::Color,
            TextureLayout::ShaderReadOnly
        )));
        assert!(!has_texture_barrier(list, writer_at..reader_at, scene_texture));
    }
}

#[test]
fn frames_end_with_resources_back_in_their_frame_layout() {
    let device = Arc::new(HeadlessDevice::default());
    let swapchain = swapchain(&device, 2);
    let (set, nodes) = presenting_set();
    let graph = compile(&device, set, 2, Some(&swapchain));

    let present = graph.backing(nodes.present).unwrap().resolve(1, 1).unwrap().texture().unwrap();
    let list = graph.command_list(1, 1).unwrap();
    let Some(Command::Barrier { textures, .. }) = list.commands().last() else {
        panic!("frame does not end with a barrier:\n{list}");
    };
    assert_eq!(textures.as_slice(), [TextureBarrier::new(present, TextureLayout::Color, TextureLayout::Present)]);
}

#[test]
fn recompiling_the_same_graph_records_identical_lists() {
    let device = Arc::new(HeadlessDevice::default());
    let swapchain = swapchain(&device, 3);
    let (set, nodes) = presenting_set();
    let mut graph = compile(&device, set, 3, Some(&swapchain));

    let lists = graph.command_lists().to_vec();
    let history = graph.backing(nodes.history).cloned();
    let pipelines = device.live_pipeline_count();

    graph.recompile(3, None).unwrap();
    assert_eq!(graph.command_lists(), lists.as_slice());
    assert_eq!(graph.backing(nodes.history).cloned(), history);
    assert_eq!(device.live_pipeline_count(), pipelines);
}

#[test]
fn dependency_cycle_is_rejected() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let a = set.add_resource(Resource::writable_image("a", image(64, 64))).unwrap();
    let b = set.add_resource(Resource::writable_image("b", image(64, 64))).unwrap();
    let first = set.add_operation(sampling("first")).unwrap();
    let second = set.add_operation(sampling("second")).unwrap();
    set.add_input(a, first, 0).unwrap();
    set.add_output(first, b, 0).unwrap();
    set.add_input(b, second, 0).unwrap();
    set.add_output(second, a, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    match err {
        CompileError::Cycle { operations } => assert_eq!(operations, ["first", "second"]),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn declared_binding_without_input_is_unresolved() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let target = set.add_resource(Resource::writable_image("target", image(64, 64))).unwrap();
    let post = set.add_operation(sampling("post")).unwrap();
    set.add_output(post, target, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::UnresolvedBinding { ref operation, binding: 0 } if operation == "post"));
}

#[test]
fn input_without_declared_binding_is_unexpected() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let source = set.add_resource(Resource::read_only_image("source", image(64, 64))).unwrap();
    let target = set.add_resource(Resource::writable_image("target", image(64, 64))).unwrap();
    let copy = set.add_operation(draw("copy")).unwrap();
    set.add_input(source, copy, 3).unwrap();
    set.add_output(copy, target, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::UnexpectedBinding { binding: 3, .. }));
}

#[test]
fn buffer_bound_to_texture_slot_is_rejected() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let params = set.add_resource(Resource::cpu_buffer("params", 64)).unwrap();
    let target = set.add_resource(Resource::writable_image("target", image(64, 64))).unwrap();
    let post = set.add_operation(sampling("post")).unwrap();
    set.add_input(params, post, 0).unwrap();
    set.add_output(post, target, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(
        err,
        CompileError::BindingKindMismatch { expected: BindingKind::SampledTexture, ref resource, .. } if resource == "params"
    ));
}

#[test]
fn outputs_of_one_operation_share_an_extent() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let color = set.add_resource(Resource::writable_image("color", image(640, 480))).unwrap();
    let normals = set.add_resource(Resource::writable_image("normals", image(320, 240))).unwrap();
    let gbuffer = set.add_operation(draw("gbuffer")).unwrap();
    set.add_output(gbuffer, color, 0).unwrap();
    set.add_output(gbuffer, normals, 1).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::InconsistentOutputExtents(ref name) if name == "gbuffer"));
    assert_eq!(err.to_string(), "inconsistent output image extents in operation \"gbuffer\"");
}

#[test]
fn read_only_images_can_not_be_written() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let lut = set.add_resource(Resource::read_only_image("lut", image(16, 16))).unwrap();
    let bake = set.add_operation(draw("bake")).unwrap();
    set.add_output(bake, lut, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::InvalidOutput { ref resource, .. } if resource == "lut"));
}

#[test]
fn duplicate_slot_is_rejected_while_connecting() {
    let mut set = ConnectionSet::new();
    let a = set.add_resource(Resource::read_only_image("a", image(16, 16))).unwrap();
    let b = set.add_resource(Resource::read_only_image("b", image(16, 16))).unwrap();
    let post = set.add_operation(sampling("post")).unwrap();
    set.add_input(a, post, 0).unwrap();

    let err = set.add_input(b, post, 0).unwrap_err();
    assert!(matches!(err, GraphError::BindingAlreadyResolved { direction: "input", binding: 0, .. }));
}

#[test]
fn layered_inputs_bind_one_element_per_layer() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let cascades = set
        .add_resource(Resource::read_only_image("cascades", image(256, 256).with_layers(4)))
        .unwrap();
    let target = set.add_resource(Resource::writable_image("target", image(64, 64))).unwrap();
    let slot = BindingSlot { count: 4, ..sampled(0) };
    let shade = set
        .add_operation(Operation::render("shade", graphics_pipeline("shade", vec![slot]), DrawDescriptor::fullscreen()))
        .unwrap();
    set.add_input(cascades, shade, BindingMeta::new(0).with_layers(4)).unwrap();
    set.add_output(shade, target, 0).unwrap();

    let graph = compile(&device, set, 1, None);
    let list = graph.command_list(0, 0).unwrap();
    let bindings = list
        .iter()
        .find_map(|command| match command {
            Command::BindResources { bindings, .. } => Some(bindings),
            _ => None,
        })
        .unwrap();
    let elements: Vec<u32> = bindings.iter().map(|binding| binding.element).collect();
    assert_eq!(elements, [0, 1, 2, 3]);

    let mut single_layer = ConnectionSet::new();
    let cascades = single_layer
        .add_resource(Resource::read_only_image("cascades", image(256, 256).with_layers(4)))
        .unwrap();
    let target = single_layer.add_resource(Resource::writable_image("target", image(64, 64))).unwrap();
    let shade = single_layer
        .add_operation(Operation::render("shade", graphics_pipeline("shade", vec![slot]), DrawDescriptor::fullscreen()))
        .unwrap();
    single_layer.add_input(cascades, shade, 0).unwrap();
    single_layer.add_output(shade, target, 0).unwrap();

    let err = try_compile(&device, single_layer, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::LayerCountMismatch { expected: 4, actual: 1, .. }));
}

#[test]
fn compute_operations_dispatch_with_their_buffers() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let params = set.add_resource(Resource::cpu_buffer("params", 64)).unwrap();
    let particles = set.add_resource(Resource::gpu_buffer("particles", 4096)).unwrap();
    let pipeline = compute_pipeline(
        "simulate",
        vec![
            BindingSlot::new(0, BindingKind::UniformBuffer, ShaderStage::Compute),
            BindingSlot::new(1, BindingKind::StorageBuffer, ShaderStage::Compute),
        ],
    );
    let simulate = set.add_operation(Operation::compute("simulate", pipeline, [64, 1, 1])).unwrap();
    set.add_input(params, simulate, 0).unwrap();
    set.add_output(simulate, particles, 1).unwrap();

    let graph = compile(&device, set, 2, None);
    let backing = graph.backing(params).unwrap();
    let params_buffer = backing.resolve(1, 0).unwrap().buffer().unwrap();
    let particles_buffer = graph.backing(particles).unwrap().resolve(1, 0).unwrap().buffer().unwrap();

    let list = graph.command_list(1, 0).unwrap();
    let mut dispatched = false;
    let mut bound = Vec::new();
    let mut buffer_barriers = Vec::new();
    for command in list {
        match command {
            Command::Dispatch(dispatch) => {
                dispatched = true;
                assert_eq!((dispatch.x, dispatch.y, dispatch.z), (64, 1, 1));
            }
            Command::BindResources { bindings, .. } => bound.extend(bindings.iter().map(|b| b.resource)),
            Command::Barrier { buffers, .. } => buffer_barriers.extend(buffers.iter().copied()),
            _ => {}
        }
    }
    assert!(dispatched);
    assert_eq!(
        bound,
        [BoundResource::UniformBuffer(params_buffer), BoundResource::StorageBuffer(particles_buffer)]
    );
    assert_eq!(
        buffer_barriers,
        [
            BufferBarrier::new(params_buffer, BufferState::HostWrite, BufferState::Uniform),
            BufferBarrier::new(params_buffer, BufferState::Uniform, BufferState::HostWrite),
        ]
    );
}

#[test]
fn compute_needs_the_compute_feature() {
    let config = HeadlessDeviceConfig {
        features: DeviceFeatures { compute: false, ..DeviceFeatures::default() },
        ..HeadlessDeviceConfig::default()
    };
    let device = Arc::new(HeadlessDevice::new(config));
    let mut set = ConnectionSet::new();
    let particles = set.add_resource(Resource::gpu_buffer("particles", 4096)).unwrap();
    let pipeline = compute_pipeline("simulate", vec![BindingSlot::new(0, BindingKind::StorageBuffer, ShaderStage::Compute)]);
    let simulate = set.add_operation(Operation::compute("simulate", pipeline, [1, 1, 1])).unwrap();
    set.add_output(simulate, particles, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::MissingFeature { feature: "compute", .. }));
}

#[test]
fn transfer_copies_between_images() {
    let device = Arc::new(HeadlessDevice::default());
    let swapchain = swapchain(&device, 2);

    let mut set = ConnectionSet::new();
    let scene = set.add_resource(Resource::writable_image("scene", image(640, 480))).unwrap();
    let present = set.add_resource(Resource::swapchain_image("present")).unwrap();
    let render = set.add_operation(draw("scene pass")).unwrap();
    let blit = set.add_operation(Operation::transfer("blit")).unwrap();
    set.add_output(render, scene, 0).unwrap();
    set.add_input(scene, blit, 0).unwrap();
    set.add_output(blit, present, 0).unwrap();

    let graph = compile(&device, set, 2, Some(&swapchain));
    let src = graph.backing(scene).unwrap().resolve(1, 1).unwrap().texture().unwrap();
    let dst = graph.backing(present).unwrap().resolve(1, 1).unwrap().texture().unwrap();

    let list = graph.command_list(1, 1).unwrap();
    let blit_at = list.operation_position("blit").unwrap();
    let Command::Barrier { textures, .. } = &list.commands()[blit_at + 1] else {
        panic!("\"blit\" does not start with a barrier:\n{list}");
    };
    assert!(textures.contains(&TextureBarrier::new(src, TextureLayout::Color, TextureLayout::TransferSrc)));
    assert!(textures.contains(&TextureBarrier::new(dst, TextureLayout::Undefined, TextureLayout::TransferDst)));
    assert!(list
        .iter()
        .any(|command| matches!(command, Command::CopyTexture { src: s, dst: d, .. } if *s == src && *d == dst)));
}

#[test]
fn transfer_needs_matching_extents() {
    let device = Arc::new(HeadlessDevice::default());
    let mut set = ConnectionSet::new();
    let small = set.add_resource(Resource::read_only_image("small", image(64, 64))).unwrap();
    let large = set.add_resource(Resource::writable_image("large", image(128, 128))).unwrap();
    let blit = set.add_operation(Operation::transfer("blit")).unwrap();
    set.add_input(small, blit, 0).unwrap();
    set.add_output(blit, large, 0).unwrap();

    let err = try_compile(&device, set, 1, None).err().unwrap();
    assert!(matches!(err, CompileError::InvalidTransfer(ref name) if name == "blit"));
}

#[test]
fn smaller_topology_releases_the_backings_it_drops() {
    let device = Arc::new(HeadlessDevice::default());
    let swapchain = swapchain(&device, 2);
    let swapchain_textures = device.live_texture_count();

    let mut set = ConnectionSet::new();
    let present = set.add_resource(Resource::swapchain_image("present")).unwrap();
    let pattern = set.add_operation(draw("pattern")).unwrap();
    let history = set.add_resource(Resource::writable_image("history", image(640, 480))).unwrap();
    set.add_output(pattern, present, 0).unwrap();
    set.add_output(pattern, history, 1).unwrap();
    let mut graph = compile(&device, set, 2, Some(&swapchain));
    let history_copies = graph.backing(history).unwrap().copy_count();
    assert_eq!(device.live_texture_count(), swapchain_textures + history_copies);

    let settings = GraphSettingsBuilder::default()
        .device(device.clone())
        .connection_set(swapchain_only_set())
        .frames_in_flight(2u32)
        .swapchain(SwapchainImages::of(&swapchain))
        .build()
        .unwrap();
    graph.compile_resources(settings).unwrap();
    graph.compile().unwrap();
    assert_eq!(device.live_texture_count(), swapchain_textures);

    drop(graph);
    assert_eq!(device.live_texture_count(), swapchain_textures);
}
