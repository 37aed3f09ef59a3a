//! Turns a [`ConnectionSet`] into per-frame command lists.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt::Write;
use log::warn;
use gears_core::collections::{hashmap::HashMap, hashset::HashSet, SmallVec};
use gears_rhi::{
    BindingKind, BoundResource, BufferBarrier, BufferHandle, BufferState, ColorAttachment, Command, CommandList,
    DeviceFeatures, Extent3D, Format, PipelineDesc, PipelineHandle, ResourceBinding, TextureBarrier,
    TextureHandle, TextureLayout,
};
use crate::connection::{Connection, ConnectionSet, OperationId, ResourceId};
use crate::error::{CompileError, GraphError};
use crate::operation::{Operation, OperationKind};
use crate::resource::{Backing, Physical, ResourceKind};
use crate::settings::SwapchainImages;

/// Operations in execution order, together with the pass (dependency depth)
/// each one belongs to.
pub(crate) struct ExecutionOrder {
    pub operations: Vec<OperationId>,
    pub passes: Vec<u32>,
}

/// Order operations so that every writer of a resource runs before its readers.
/// Independent operations keep their insertion order.
#[profiling::function]
pub(crate) fn execution_order(set: &ConnectionSet) -> Result<ExecutionOrder, CompileError> {
    let node_count = set.nodes().len();
    let mut in_degree = vec![0u32; node_count];
    let mut successors: Vec<Vec<u32>> = vec![Vec::new(); node_count];
    let mut edges = HashSet::default();

    for (reader, _) in set.operations() {
        for input in set.inputs_of(reader) {
            for writer in set.writers_of(input.resource) {
                if writer != reader && edges.insert((writer, reader)) {
                    successors[writer.index()].push(reader.0);
                    in_degree[reader.index()] += 1;
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<u32>> = set
        .operations()
        .filter(|(id, _)| in_degree[id.index()] == 0)
        .map(|(id, _)| Reverse(id.0))
        .collect();
    let mut depth = vec![0u32; node_count];
    let mut order = ExecutionOrder { operations: Vec::new(), passes: Vec::new() };

    while let Some(Reverse(index)) = ready.pop() {
        let pass = depth[index as usize];
        order.operations.push(OperationId(index));
        order.passes.push(pass);

        for &next in &successors[index as usize] {
            let next = next as usize;
            depth[next] = depth[next].max(pass + 1);
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next as u32));
            }
        }
    }

    let operation_count = set.operations().count();
    if order.operations.len() != operation_count {
        let operations = set
            .operations()
            .filter(|(id, _)| in_degree[id.index()] > 0)
            .map(|(_, operation)| operation.name().to_owned())
            .collect();
        return Err(CompileError::Cycle { operations });
    }
    Ok(order)
}

/// Read-only view of everything recording needs.
pub(crate) struct CompileContext<'a> {
    pub set: &'a ConnectionSet,
    pub backings: &'a [Option<Backing>],
    pub swapchain: Option<&'a SwapchainImages>,
    pub features: DeviceFeatures,
}

impl<'a> CompileContext<'a> {
    fn kind(&self, id: ResourceId) -> Result<&'a ResourceKind, CompileError> {
        self.set
            .resource(id)
            .map(|resource| resource.kind())
            .ok_or(CompileError::Graph(GraphError::UnknownNode { kind: "resource", index: id.0 }))
    }

    fn resource_name(&self, id: ResourceId) -> String {
        self.set.resource(id).map(|resource| resource.name().to_owned()).unwrap_or_default()
    }

    pub fn image_extent(&self, id: ResourceId) -> Option<Extent3D> {
        match self.set.resource(id)?.kind() {
            ResourceKind::SwapchainImage => self.swapchain.map(|swapchain| swapchain.extent.into()),
            kind => kind.image_desc().map(|desc| desc.extent),
        }
    }

    pub fn image_format(&self, id: ResourceId) -> Option<Format> {
        match self.set.resource(id)?.kind() {
            ResourceKind::SwapchainImage => self.swapchain.map(|swapchain| swapchain.format),
            kind => kind.image_desc().map(|desc| desc.format),
        }
    }

    fn physical(&self, connection: &Connection, slot: usize, image: usize) -> Result<Physical, CompileError> {
        let copy = if connection.binding.per_frame { slot } else { 0 };
        self.backings
            .get(connection.resource.index())
            .and_then(Option::as_ref)
            .and_then(|backing| backing.resolve(copy, image))
            .ok_or(CompileError::ResourcesNotCompiled)
    }

    /// Connections an operation binds through its pipeline, in binding order.
    /// Compute operations bind their outputs as well.
    fn bound_connections(&self, id: OperationId, operation: &Operation) -> Vec<&'a Connection> {
        let mut bound: Vec<&Connection> = self.set.inputs_of(id).collect();
        if let OperationKind::Compute(_) = operation.kind() {
            for output in self.set.outputs_of(id) {
                let duplicate = bound
                    .iter()
                    .any(|c| c.binding.binding == output.binding.binding && c.resource == output.resource);
                if !duplicate {
                    bound.push(output);
                }
            }
        }
        bound.sort_by_key(|c| c.binding.binding);
        bound
    }

    /// Image outputs in attachment order.
    fn image_outputs(&self, id: OperationId) -> Vec<&'a Connection> {
        let mut outputs: Vec<&Connection> = self
            .set
            .outputs_of(id)
            .filter(|c| self.kind(c.resource).is_ok_and(ResourceKind::is_image))
            .collect();
        outputs.sort_by_key(|c| c.binding.binding);
        outputs
    }

    /// Check one operation against its pipeline and the device.
    pub fn validate_operation(&self, id: OperationId, operation: &Operation) -> Result<(), CompileError> {
        let name = operation.name();

        match operation.kind() {
            OperationKind::Render(render) if render.pipeline.is_compute() => {
                return Err(CompileError::PipelineKindMismatch { operation: name.to_owned() });
            }
            OperationKind::Compute(compute) => {
                if !compute.pipeline.is_compute() {
                    return Err(CompileError::PipelineKindMismatch { operation: name.to_owned() });
                }
                if !self.features.compute {
                    return Err(CompileError::MissingFeature { node: name.to_owned(), feature: "compute" });
                }
            }
            _ => {}
        }

        for output in self.set.outputs_of(id) {
            let kind = self.kind(output.resource)?;
            let writable = match operation.kind() {
                OperationKind::Render(_) => kind.is_image() && !matches!(kind, ResourceKind::ReadOnlyImage(_)),
                _ => !matches!(kind, ResourceKind::ReadOnlyImage(_)),
            };
            let feedback = !matches!(operation.kind(), OperationKind::Compute(_))
                && self.set.inputs_of(id).any(|input| input.resource == output.resource);
            if !writable || feedback {
                return Err(CompileError::InvalidOutput {
                    operation: name.to_owned(),
                    resource: self.resource_name(output.resource),
                });
            }
        }

        let image_outputs = self.image_outputs(id);
        if let Some(first) = image_outputs.first() {
            let extent = self.image_extent(first.resource);
            if image_outputs.iter().any(|c| self.image_extent(c.resource) != extent) {
                return Err(CompileError::InconsistentOutputExtents(name.to_owned()));
            }
        }

        match operation.kind() {
            OperationKind::Render(_) if image_outputs.is_empty() => {
                return Err(CompileError::MissingRenderTarget(name.to_owned()));
            }
            OperationKind::Transfer => {
                let inputs: Vec<_> = self.set.inputs_of(id).collect();
                let outputs: Vec<_> = self.set.outputs_of(id).collect();
                let valid = inputs.len() == 1
                    && outputs.len() == 1
                    && self.kind(inputs[0].resource)?.is_image()
                    && self.kind(outputs[0].resource)?.is_image()
                    && self.image_extent(inputs[0].resource) == self.image_extent(outputs[0].resource);
                if !valid {
                    return Err(CompileError::InvalidTransfer(name.to_owned()));
                }
                return Ok(());
            }
            OperationKind::Compute(_) if self.set.outputs_of(id).next().is_none() => {
                warn!("Operation [{name}] has no outputs, its work is never observed!");
            }
            _ => {}
        }

        let Some(pipeline) = operation.pipeline() else {
            return Ok(());
        };
        self.validate_bindings(id, operation, pipeline)
    }

    fn validate_bindings(&self, id: OperationId, operation: &Operation, pipeline: &PipelineDesc) -> Result<(), CompileError> {
        let name = operation.name();
        let bound = self.bound_connections(id, operation);

        for pair in bound.windows(2) {
            if pair[0].binding.binding == pair[1].binding.binding {
                return Err(GraphError::BindingAlreadyResolved {
                    operation: name.to_owned(),
                    direction: "output",
                    binding: pair[1].binding.binding,
                }
                .into());
            }
        }

        for connection in &bound {
            if pipeline.binding(connection.binding.binding).is_none() {
                return Err(CompileError::UnexpectedBinding {
                    operation: name.to_owned(),
                    binding: connection.binding.binding,
                });
            }
        }

        for slot in &pipeline.bindings {
            let connection = bound
                .iter()
                .find(|c| c.binding.binding == slot.binding)
                .ok_or_else(|| CompileError::UnresolvedBinding {
                    operation: name.to_owned(),
                    binding: slot.binding,
                })?;

            let kind = self.kind(connection.resource)?;
            if slot.kind.is_texture() != kind.is_image() {
                return Err(CompileError::BindingKindMismatch {
                    operation: name.to_owned(),
                    binding: slot.binding,
                    expected: slot.kind,
                    resource: self.resource_name(connection.resource),
                });
            }
            if slot.kind == BindingKind::StorageTexture && !self.features.storage_textures {
                return Err(CompileError::MissingFeature { node: name.to_owned(), feature: "storage_textures" });
            }
            if connection.binding.layer_count != slot.count {
                return Err(CompileError::LayerCountMismatch {
                    operation: name.to_owned(),
                    binding: slot.binding,
                    expected: slot.count,
                    actual: connection.binding.layer_count,
                });
            }
        }
        Ok(())
    }

    /// Pipeline description an operation is created with. Render pipelines
    /// learn their attachment formats from the operation's outputs.
    pub fn pipeline_desc(&self, id: OperationId, operation: &Operation) -> Option<PipelineDesc> {
        match operation.kind() {
            OperationKind::Render(render) => {
                let formats = self
                    .image_outputs(id)
                    .iter()
                    .filter_map(|c| self.image_format(c.resource))
                    .collect();
                Some(render.pipeline.clone().with_color_formats(formats))
            }
            OperationKind::Compute(compute) => Some(compute.pipeline.clone()),
            OperationKind::Transfer => None,
        }
    }

    /// Record the commands of one frame slot rendering into swapchain image `image`.
    #[profiling::function]
    pub fn record(
        &self,
        order: &[OperationId],
        pipelines: &HashMap<OperationId, PipelineHandle>,
        slot: usize,
        image: usize,
    ) -> Result<CommandList, CompileError> {
        let mut list = CommandList::new(format!("frame {slot} image {image}"));
        let mut tracker = StateTracker::default();

        for &id in order {
            let Some(operation) = self.set.operation(id) else { continue };
            let pipeline_desc = operation.pipeline();
            let binding_kind = |c: &Connection| {
                pipeline_desc.and_then(|p| p.binding(c.binding.binding)).map(|s| s.kind)
            };

            list.push(Command::BeginOperation { name: operation.name().to_owned() });

            let mut textures = SmallVec::<[TextureBarrier; 8]>::new();
            let mut buffers = SmallVec::<[BufferBarrier; 4]>::new();
            for input in self.set.inputs_of(id) {
                let kind = self.kind(input.resource)?;
                match self.physical(input, slot, image)? {
                    Physical::Texture(texture) => tracker.transition_texture(
                        texture,
                        kind.initial_layout(),
                        operation.input_layout(binding_kind(input)),
                        &mut textures,
                    ),
                    Physical::Buffer(buffer) => tracker.transition_buffer(
                        buffer,
                        kind.initial_buffer_state(),
                        operation.input_buffer_state(binding_kind(input)),
                        &mut buffers,
                    ),
                }
            }
            for output in self.set.outputs_of(id) {
                let kind = self.kind(output.resource)?;
                match self.physical(output, slot, image)? {
                    Physical::Texture(texture) => tracker.transition_texture(
                        texture,
                        kind.initial_layout(),
                        operation.output_layout(),
                        &mut textures,
                    ),
                    Physical::Buffer(buffer) => tracker.transition_buffer(
                        buffer,
                        kind.initial_buffer_state(),
                        BufferState::Storage,
                        &mut buffers,
                    ),
                }
            }
            list.barriers(textures, buffers);

            match operation.kind() {
                OperationKind::Render(render) => {
                    let pipeline = self.pipeline(pipelines, id)?;
                    let outputs = self.image_outputs(id);
                    let mut attachments = SmallVec::<[ColorAttachment; 4]>::new();
                    for output in &outputs {
                        if let Some(texture) = self.physical(output, slot, image)?.texture() {
                            attachments.push(ColorAttachment { texture, load_op: operation.load_op() });
                        }
                    }
                    let extent = outputs
                        .first()
                        .and_then(|c| self.image_extent(c.resource))
                        .ok_or_else(|| CompileError::MissingRenderTarget(operation.name().to_owned()))?;

                    list.push(Command::BeginRendering { attachments, extent: extent.to_2d() });
                    list.push(Command::BindPipeline { pipeline });
                    let bindings = self.resource_bindings(id, operation, slot, image)?;
                    if !bindings.is_empty() {
                        list.push(Command::BindResources { pipeline, bindings });
                    }
                    list.push(Command::Draw(render.draw.into()));
                    list.push(Command::EndRendering);
                }
                OperationKind::Compute(_) => {
                    let pipeline = self.pipeline(pipelines, id)?;
                    list.push(Command::BindPipeline { pipeline });
                    let bindings = self.resource_bindings(id, operation, slot, image)?;
                    if !bindings.is_empty() {
                        list.push(Command::BindResources { pipeline, bindings });
                    }
                    if let Some(dispatch) = operation.dispatch() {
                        list.push(Command::Dispatch(dispatch));
                    }
                }
                OperationKind::Transfer => {
                    let (Some(input), Some(output)) = (self.set.inputs_of(id).next(), self.set.outputs_of(id).next())
                    else {
                        return Err(CompileError::InvalidTransfer(operation.name().to_owned()));
                    };
                    let src = self.physical(input, slot, image)?.texture();
                    let dst = self.physical(output, slot, image)?.texture();
                    let extent = self.image_extent(output.resource);
                    let (Some(src), Some(dst), Some(extent)) = (src, dst, extent) else {
                        return Err(CompileError::InvalidTransfer(operation.name().to_owned()));
                    };
                    list.push(Command::CopyTexture { src, dst, extent });
                }
            }

            for output in self.set.outputs_of(id) {
                tracker.pending_writes.insert(self.physical(output, slot, image)?);
            }
            list.push(Command::EndOperation);
        }

        // every frame ends where the next one starts
        let mut textures = SmallVec::<[TextureBarrier; 8]>::new();
        let mut buffers = SmallVec::<[BufferBarrier; 4]>::new();
        for (id, resource) in self.set.resources() {
            let kind = resource.kind();
            let Some(backing) = self.backings.get(id.index()).and_then(Option::as_ref) else { continue };
            let mut copies: SmallVec<[Physical; 2]> = SmallVec::new();
            copies.extend(backing.resolve(slot, image));
            if let Backing::Multi(all) = backing {
                // static edges may have touched the first copy
                if slot != 0 {
                    copies.extend(all.first().copied());
                }
            }
            for physical in copies {
                match physical {
                    Physical::Texture(texture) => {
                        let current = tracker.layout(texture, kind.initial_layout());
                        if current != kind.final_layout() {
                            textures.push(TextureBarrier::new(texture, current, kind.final_layout()));
                        }
                    }
                    Physical::Buffer(buffer) => {
                        let current = tracker.buffer_state(buffer, kind.initial_buffer_state());
                        if current != kind.initial_buffer_state() {
                            buffers.push(BufferBarrier::new(buffer, current, kind.initial_buffer_state()));
                        }
                    }
                }
            }
        }
        list.barriers(textures, buffers);

        Ok(list)
    }

    fn pipeline(&self, pipelines: &HashMap<OperationId, PipelineHandle>, id: OperationId) -> Result<PipelineHandle, CompileError> {
        pipelines.get(&id).copied().ok_or(CompileError::ResourcesNotCompiled)
    }

    fn resource_bindings(
        &self,
        id: OperationId,
        operation: &Operation,
        slot: usize,
        image: usize,
    ) -> Result<Vec<ResourceBinding>, CompileError> {
        let Some(pipeline) = operation.pipeline() else {
            return Ok(Vec::new());
        };

        let mut bindings = Vec::new();
        for connection in self.bound_connections(id, operation) {
            let Some(binding_slot) = pipeline.binding(connection.binding.binding) else { continue };
            let physical = self.physical(connection, slot, image)?;
            let resource = match (binding_slot.kind, physical) {
                (BindingKind::SampledTexture, Physical::Texture(texture)) => BoundResource::SampledTexture(texture),
                (BindingKind::StorageTexture, Physical::Texture(texture)) => BoundResource::StorageTexture(texture),
                (BindingKind::UniformBuffer, Physical::Buffer(buffer)) => BoundResource::UniformBuffer(buffer),
                (BindingKind::StorageBuffer, Physical::Buffer(buffer)) => BoundResource::StorageBuffer(buffer),
                (expected, _) => {
                    return Err(CompileError::BindingKindMismatch {
                        operation: operation.name().to_owned(),
                        binding: connection.binding.binding,
                        expected,
                        resource: self.resource_name(connection.resource),
                    });
                }
            };
            for element in 0..connection.binding.layer_count {
                bindings.push(ResourceBinding { binding: connection.binding.binding, element, resource });
            }
        }
        Ok(bindings)
    }

    /// Human readable listing of passes, operations and their connections.
    pub fn dump(&self, order: &ExecutionOrder) -> String {
        let mut out = String::new();
        let mut current_pass = None;
        for (&id, &pass) in order.operations.iter().zip(&order.passes) {
            let Some(operation) = self.set.operation(id) else { continue };
            if current_pass != Some(pass) {
                let _ = writeln!(out, "Pass {pass}");
                current_pass = Some(pass);
            }
            let _ = writeln!(out, "  Operation \"{}\"", operation.name());
            let _ = writeln!(out, "    Inputs");
            for input in self.set.inputs_of(id) {
                let _ = writeln!(out, "      \"{}\" (binding {})", self.resource_name(input.resource), input.binding.binding);
            }
            let _ = writeln!(out, "    Outputs");
            for output in self.set.outputs_of(id) {
                let _ = writeln!(out, "      \"{}\" (binding {})", self.resource_name(output.resource), output.binding.binding);
            }
        }
        out
    }
}

/// Layouts and access states while recording one command list.
#[derive(Default)]
struct StateTracker {
    layouts: HashMap<TextureHandle, TextureLayout>,
    buffer_states: HashMap<BufferHandle, BufferState>,
    /// Written by an earlier operation with no barrier recorded since.
    pending_writes: HashSet<Physical>,
}

impl StateTracker {
    fn layout(&self, texture: TextureHandle, initial: TextureLayout) -> TextureLayout {
        self.layouts.get(&texture).copied().unwrap_or(initial)
    }

    fn buffer_state(&self, buffer: BufferHandle, initial: BufferState) -> BufferState {
        self.buffer_states.get(&buffer).copied().unwrap_or(initial)
    }

    fn transition_texture(
        &mut self,
        texture: TextureHandle,
        initial: TextureLayout,
        next: TextureLayout,
        barriers: &mut SmallVec<[TextureBarrier; 8]>,
    ) {
        let current = self.layout(texture, initial);
        let pending = self.pending_writes.remove(&Physical::Texture(texture));
        if current != next || pending {
            barriers.push(TextureBarrier::new(texture, current, next));
            self.layouts.insert(texture, next);
        }
    }

    fn transition_buffer(
        &mut self,
        buffer: BufferHandle,
        initial: BufferState,
        next: BufferState,
        barriers: &mut SmallVec<[BufferBarrier; 4]>,
    ) {
        let current = self.buffer_state(buffer, initial);
        let pending = self.pending_writes.remove(&Physical::Buffer(buffer));
        if current != next || pending {
            barriers.push(BufferBarrier::new(buffer, current, next));
            self.buffer_states.insert(buffer, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::{PipelineDescBuilder, ShaderBinary, ShaderProgram};
    use crate::operation::DrawDescriptor;
    use crate::resource::{ImageDesc, Resource};

    fn graphics(name: &str) -> PipelineDesc {
        let binary = ShaderBinary::from_words(vec![0x0723_0203]);
        PipelineDescBuilder::default()
            .name(name)
            .program(ShaderProgram::Graphics { vertex: binary.clone(), fragment: binary })
            .build()
            .unwrap()
    }

    fn image(name: &str) -> Resource {
        Resource::writable_image(name, ImageDesc::new_2d(8, 8, Format::Rgba8Unorm))
    }

    fn names(set: &ConnectionSet, order: &ExecutionOrder) -> Vec<String> {
        order
            .operations
            .iter()
            .map(|id| set.operation(*id).unwrap().name().to_owned())
            .collect()
    }

    #[test]
    fn independent_operations_keep_insertion_order() {
        let mut set = ConnectionSet::new();
        for name in ["c", "a", "b"] {
            let target = set.add_resource(image(&format!("{name} target"))).unwrap();
            let op = set
                .add_operation(Operation::render(name, graphics(name), DrawDescriptor::fullscreen()))
                .unwrap();
            set.add_output(op, target, 0).unwrap();
        }

        let order = execution_order(&set).unwrap();
        assert_eq!(names(&set, &order), vec!["c", "a", "b"]);
        assert_eq!(order.passes, vec![0, 0, 0]);
    }

    #[test]
    fn readers_follow_writers() {
        let mut set = ConnectionSet::new();
        let shared = set.add_resource(image("shared")).unwrap();
        let out = set.add_resource(image("out")).unwrap();
        let reader = set.add_operation(Operation::transfer("reader")).unwrap();
        let writer = set
            .add_operation(Operation::render("writer", graphics("w"), DrawDescriptor::fullscreen()))
            .unwrap();
        set.add_input(shared, reader, 0).unwrap();
        set.add_output(reader, out, 0).unwrap();
        set.add_output(writer, shared, 0).unwrap();

        let order = execution_order(&set).unwrap();
        assert_eq!(names(&set, &order), vec!["writer", "reader"]);
        assert_eq!(order.passes, vec![0, 1]);
    }

    #[test]
    fn cycles_are_reported() {
        let mut set = ConnectionSet::new();
        let a = set.add_resource(image("a")).unwrap();
        let b = set.add_resource(image("b")).unwrap();
        let first = set.add_operation(Operation::transfer("first")).unwrap();
        let second = set.add_operation(Operation::transfer("second")).unwrap();
        set.add_input(a, first, 0).unwrap();
        set.add_output(first, b, 0).unwrap();
        set.add_input(b, second, 0).unwrap();
        set.add_output(second, a, 0).unwrap();

        match execution_order(&set) {
            Err(CompileError::Cycle { operations }) => assert_eq!(operations, vec!["first", "second"]),
            other => panic!("expected a cycle, got {:?}", other.map(|o| o.operations)),
        }
    }

    #[test]
    fn pending_writes_force_same_layout_barriers() {
        let mut tracker = StateTracker::default();
        let texture = TextureHandle::default();
        let mut barriers = SmallVec::new();

        tracker.transition_texture(texture, TextureLayout::General, TextureLayout::General, &mut barriers);
        assert!(barriers.is_empty());

        tracker.pending_writes.insert(Physical::Texture(texture));
        tracker.transition_texture(texture, TextureLayout::General, TextureLayout::General, &mut barriers);
        assert_eq!(barriers.len(), 1);

        // the hazard is resolved once
        tracker.transition_texture(texture, TextureLayout::General, TextureLayout::General, &mut barriers);
        assert_eq!(barriers.len(), 1);
    }
}
