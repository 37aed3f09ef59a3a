//! The device contract the render graph is written against.

use std::time::Duration;
use crate::buffer::BufferDesc;
use crate::command::CommandList;
use crate::error::RhiError;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, PipelineHandle, QueueHandle,
    SemaphoreHandle, TextureHandle,
};
use crate::pipeline::PipelineDesc;
use crate::texture::TextureDesc;

/// Optional capabilities a graph may depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub compute: bool,
    pub storage_textures: bool,
    pub texture_3d: bool,
}

impl Default for DeviceFeatures {
    fn default() -> Self {
        Self { compute: true, storage_textures: true, texture_3d: true }
    }
}

/// One queue submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitInfo<'a> {
    pub command_buffers: &'a [CommandBufferHandle],
    /// Waited on at colour attachment output.
    pub wait_semaphores: &'a [SemaphoreHandle],
    pub signal_semaphores: &'a [SemaphoreHandle],
    /// Signalled once every command buffer of this submission completed.
    pub fence: Option<FenceHandle>,
}

/// A logical GPU device.
///
/// All methods take `&self`; backends synchronise their object tables
/// internally so the device can be shared as `Arc<dyn RenderDevice>`.
pub trait RenderDevice: Send + Sync {
    fn name(&self) -> &str;

    fn features(&self) -> DeviceFeatures;

    fn graphics_queue(&self) -> QueueHandle;

    fn create_command_pool(&self, queue: QueueHandle) -> Result<CommandPoolHandle, RhiError>;

    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    fn create_fence(&self, name: &str, signaled: bool) -> Result<FenceHandle, RhiError>;

    fn destroy_fence(&self, fence: FenceHandle);

    /// Block until `fence` is signalled. `None` waits forever.
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> Result<(), RhiError>;

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), RhiError>;

    fn is_fence_signaled(&self, fence: FenceHandle) -> Result<bool, RhiError>;

    fn create_semaphore(&self, name: &str) -> Result<SemaphoreHandle, RhiError>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle, RhiError>;

    fn destroy_texture(&self, texture: TextureHandle);

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, RhiError>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Copy `data` into a host visible buffer.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), RhiError>;

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle, RhiError>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    /// Record `commands` into a new command buffer allocated from `pool`.
    fn create_command_buffer(&self, pool: CommandPoolHandle, commands: &CommandList) -> Result<CommandBufferHandle, RhiError>;

    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle);

    fn submit(&self, queue: QueueHandle, info: &SubmitInfo<'_>) -> Result<(), RhiError>;

    fn wait_queue_idle(&self, queue: QueueHandle) -> Result<(), RhiError>;

    fn wait_idle(&self) -> Result<(), RhiError>;
}
