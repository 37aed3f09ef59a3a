//! Backend-neutral command lists.
//!
//! The render graph records into a [`CommandList`]; each backend turns the
//! list into its own command buffer when it is handed to
//! `RenderDevice::create_command_buffer`.

use std::fmt;
use gears_core::collections::SmallVec;
use crate::barrier::{BufferBarrier, TextureBarrier};
use crate::format::{Extent2D, Extent3D};
use crate::handle::{BufferHandle, PipelineHandle, TextureHandle};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LoadOp {
    Load,
    Clear([f32; 4]),
    DontCare,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    pub load_op: LoadOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoundResource {
    SampledTexture(TextureHandle),
    StorageTexture(TextureHandle),
    UniformBuffer(BufferHandle),
    StorageBuffer(BufferHandle),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceBinding {
    pub binding: u32,
    /// Array element, one per texture layer.
    pub element: u32,
    pub resource: BoundResource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawParams {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchParams {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Marks the start of an operation's commands. Backends may emit a debug label.
    BeginOperation { name: String },
    EndOperation,
    Barrier {
        textures: SmallVec<[TextureBarrier; 8]>,
        buffers: SmallVec<[BufferBarrier; 4]>,
    },
    BeginRendering {
        attachments: SmallVec<[ColorAttachment; 4]>,
        extent: Extent2D,
    },
    EndRendering,
    BindPipeline { pipeline: PipelineHandle },
    BindResources {
        pipeline: PipelineHandle,
        bindings: Vec<ResourceBinding>,
    },
    Draw(DrawParams),
    Dispatch(DispatchParams),
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
        extent: Extent3D,
    },
}

/// An ordered list of commands plus a debug name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandList {
    name: String,
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), commands: Vec::new() }
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Record a barrier batch, skipping empty ones.
    pub fn barriers(&mut self, textures: SmallVec<[TextureBarrier; 8]>, buffers: SmallVec<[BufferBarrier; 4]>) {
        if textures.is_empty() && buffers.is_empty() {
            return;
        }
        self.commands.push(Command::Barrier { textures, buffers });
    }

    #[inline]
    pub fn commands(&self) -> &[Command] { &self.commands }

    #[inline]
    pub fn len(&self) -> usize { self.commands.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.commands.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    /// Index of the `BeginOperation` carrying `name`.
    pub fn operation_position(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|command| {
            matches!(command, Command::BeginOperation { name: n } if n == name)
        })
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

impl fmt::Display for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CommandList \"{}\"", self.name)?;
        for command in &self.commands {
            match command {
                Command::BeginOperation { name } => writeln!(f, "  begin \"{name}\"")?,
                Command::EndOperation => writeln!(f, "  end")?,
                Command::Barrier { textures, buffers } => {
                    for barrier in textures {
                        writeln!(f, "    barrier {:?} {:?} -> {:?}", barrier.texture, barrier.old_layout, barrier.new_layout)?;
                    }
                    for barrier in buffers {
                        writeln!(f, "    barrier {:?} {:?} -> {:?}", barrier.buffer, barrier.src_state, barrier.dst_state)?;
                    }
                }
                other => writeln!(f, "    {other:?}")?,
            }
        }
        Ok(())
    }
}
