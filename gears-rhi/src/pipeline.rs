//! Pipeline descriptions consumed from the shader/pipeline provider.
//!
//! Shaders arrive as SPIR-V together with the binding-slot metadata their
//! reflection produced. Nothing here compiles or reflects shaders.

use std::sync::Arc;
use derive_builder::Builder;
use enumflags2::{bitflags, BitFlags};
use crate::error::RhiError;
use crate::format::Format;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Precompiled SPIR-V module.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderBinary {
    words: Arc<[u32]>,
}

impl ShaderBinary {
    pub fn from_words(words: impl Into<Arc<[u32]>>) -> Self {
        Self { words: words.into() }
    }

    /// Parse a little-endian SPIR-V byte stream.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RhiError> {
        if bytes.len() % 4 != 0 {
            return Err(RhiError::PipelineCreation {
                name: String::new(),
                reason: format!("SPIR-V length {} is not a multiple of 4", bytes.len()),
            });
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(RhiError::PipelineCreation {
                name: String::new(),
                reason: "missing SPIR-V magic number".to_owned(),
            });
        }
        Ok(Self::from_words(words))
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderProgram {
    Graphics {
        vertex: ShaderBinary,
        fragment: ShaderBinary,
    },
    Compute(ShaderBinary),
}

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex = 1 << 0,
    Fragment = 1 << 1,
    Compute = 1 << 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    SampledTexture,
    StorageTexture,
    UniformBuffer,
    StorageBuffer,
}

impl BindingKind {
    pub fn is_texture(self) -> bool {
        matches!(self, BindingKind::SampledTexture | BindingKind::StorageTexture)
    }
}

/// One descriptor binding a pipeline expects to be resolved by an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: BitFlags<ShaderStage>,
    /// Array size, one per texture layer.
    pub count: u32,
}

impl BindingSlot {
    pub fn new(binding: u32, kind: BindingKind, stages: impl Into<BitFlags<ShaderStage>>) -> Self {
        Self { binding, kind, stages: stages.into(), count: 1 }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Builder)]
#[builder(setter(into))]
pub struct PipelineDesc {
    pub name: String,
    pub program: ShaderProgram,
    #[builder(default)]
    pub topology: PrimitiveTopology,
    #[builder(default)]
    pub bindings: Vec<BindingSlot>,
    /// Formats of the colour attachments, in output binding order.
    #[builder(default)]
    pub color_formats: Vec<Format>,
    #[builder(default)]
    pub blend_enabled: bool,
}

impl PipelineDesc {
    pub fn is_compute(&self) -> bool {
        matches!(self.program, ShaderProgram::Compute(_))
    }

    pub fn binding(&self, binding: u32) -> Option<&BindingSlot> {
        self.bindings.iter().find(|slot| slot.binding == binding)
    }

    pub fn with_color_formats(mut self, formats: Vec<Format>) -> Self {
        self.color_formats = formats;
        self
    }
}
