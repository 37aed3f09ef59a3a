//! Units of GPU work.

use gears_rhi::{BindingKind, BufferState, DispatchParams, DrawParams, LoadOp, PipelineDesc, TextureLayout};

/// Vertex and instance counts of a draw. Geometry is generated by the vertex
/// shader, so there are no vertex buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawDescriptor {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawDescriptor {
    pub fn new(vertex_count: u32, instance_count: u32) -> Self {
        Self { vertex_count, instance_count, first_vertex: 0, first_instance: 0 }
    }

    /// A single triangle covering the whole target.
    pub fn fullscreen() -> Self {
        Self::new(3, 1)
    }
}

impl From<DrawDescriptor> for DrawParams {
    fn from(value: DrawDescriptor) -> Self {
        DrawParams {
            vertex_count: value.vertex_count,
            instance_count: value.instance_count,
            first_vertex: value.first_vertex,
            first_instance: value.first_instance,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderOperation {
    pub pipeline: PipelineDesc,
    pub draw: DrawDescriptor,
    /// Outputs are loaded when `None`.
    pub clear_color: Option<[f32; 4]>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComputeOperation {
    pub pipeline: PipelineDesc,
    pub workgroups: [u32; 3],
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationKind {
    Render(RenderOperation),
    Compute(ComputeOperation),
    /// Copies its single image input into its single image output.
    Transfer,
}

/// A node standing for one draw, dispatch or copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    name: String,
    kind: OperationKind,
}

impl Operation {
    pub fn render(name: impl Into<String>, pipeline: PipelineDesc, draw: DrawDescriptor) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Render(RenderOperation { pipeline, draw, clear_color: None }),
        }
    }

    pub fn compute(name: impl Into<String>, pipeline: PipelineDesc, workgroups: [u32; 3]) -> Self {
        Self {
            name: name.into(),
            kind: OperationKind::Compute(ComputeOperation { pipeline, workgroups }),
        }
    }

    pub fn transfer(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: OperationKind::Transfer }
    }

    /// Clear the render targets before drawing. Ignored by other kinds.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        if let OperationKind::Render(render) = &mut self.kind {
            render.clear_color = Some(color);
        }
        self
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    #[inline]
    pub fn kind(&self) -> &OperationKind { &self.kind }

    pub fn pipeline(&self) -> Option<&PipelineDesc> {
        match &self.kind {
            OperationKind::Render(render) => Some(&render.pipeline),
            OperationKind::Compute(compute) => Some(&compute.pipeline),
            OperationKind::Transfer => None,
        }
    }

    /// Layout an image input is read in. `binding` is the pipeline slot it is
    /// bound to, when there is one.
    pub fn input_layout(&self, binding: Option<BindingKind>) -> TextureLayout {
        match (&self.kind, binding) {
            (OperationKind::Transfer, _) => TextureLayout::TransferSrc,
            (OperationKind::Compute(_), _) => TextureLayout::General,
            (OperationKind::Render(_), Some(BindingKind::StorageTexture)) => TextureLayout::General,
            (OperationKind::Render(_), _) => TextureLayout::ShaderReadOnly,
        }
    }

    /// Layout an image output is written in.
    pub fn output_layout(&self) -> TextureLayout {
        match &self.kind {
            OperationKind::Render(_) => TextureLayout::Color,
            OperationKind::Compute(_) => TextureLayout::General,
            OperationKind::Transfer => TextureLayout::TransferDst,
        }
    }

    pub fn input_buffer_state(&self, binding: Option<BindingKind>) -> BufferState {
        match binding {
            Some(BindingKind::UniformBuffer) => BufferState::Uniform,
            _ => BufferState::Storage,
        }
    }

    pub(crate) fn load_op(&self) -> LoadOp {
        match &self.kind {
            OperationKind::Render(RenderOperation { clear_color: Some(color), .. }) => LoadOp::Clear(*color),
            _ => LoadOp::Load,
        }
    }

    pub(crate) fn dispatch(&self) -> Option<DispatchParams> {
        match &self.kind {
            OperationKind::Compute(compute) => {
                let [x, y, z] = compute.workgroups;
                Some(DispatchParams { x, y, z })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::{PipelineDescBuilder, ShaderBinary, ShaderProgram};

    fn pipeline() -> PipelineDesc {
        let binary = ShaderBinary::from_words(vec![0x0723_0203]);
        PipelineDescBuilder::default()
            .name("p")
            .program(ShaderProgram::Graphics { vertex: binary.clone(), fragment: binary })
            .build()
            .unwrap()
    }

    #[test]
    fn layouts_per_kind() {
        let render = Operation::render("draw", pipeline(), DrawDescriptor::fullscreen());
        assert_eq!(render.input_layout(Some(BindingKind::SampledTexture)), TextureLayout::ShaderReadOnly);
        assert_eq!(render.input_layout(Some(BindingKind::StorageTexture)), TextureLayout::General);
        assert_eq!(render.output_layout(), TextureLayout::Color);

        let copy = Operation::transfer("copy");
        assert_eq!(copy.input_layout(None), TextureLayout::TransferSrc);
        assert_eq!(copy.output_layout(), TextureLayout::TransferDst);
    }

    #[test]
    fn clear_color_only_applies_to_render() {
        let render = Operation::render("draw", pipeline(), DrawDescriptor::fullscreen()).with_clear_color([1.0; 4]);
        assert_eq!(render.load_op(), LoadOp::Clear([1.0; 4]));

        let copy = Operation::transfer("copy").with_clear_color([1.0; 4]);
        assert_eq!(copy.load_op(), LoadOp::Load);
        assert!(copy.pipeline().is_none());
    }
}
