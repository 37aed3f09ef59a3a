//! Gears RHI (Render Hardware Interface).
//!
//! Backend-neutral descriptions, command lists and the [`RenderDevice`] /
//! [`Swapchain`] contracts, plus a headless backend and a Vulkan backend.

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod format;
pub mod handle;
pub mod headless;
pub mod pipeline;
pub mod swapchain;
pub mod synchronization;
pub mod texture;
#[cfg(feature = "vulkan")]
pub mod vulkan;

#[cfg(feature = "vulkan")]
pub use ash::vk;

pub use barrier::{BufferBarrier, BufferState, PipelineStage, PipelineStages, TextureBarrier, TextureLayout};
pub use buffer::{BufferDesc, BufferUsage, MemoryLocation};
pub use command::{
    BoundResource, ColorAttachment, Command, CommandList, DispatchParams, DrawParams, LoadOp, ResourceBinding,
};
pub use device::{DeviceFeatures, RenderDevice, SubmitInfo};
pub use error::{RhiError, SwapchainError};
pub use format::{Extent2D, Extent3D, Format};
pub use handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, PipelineHandle, QueueHandle,
    SemaphoreHandle, TextureHandle,
};
pub use pipeline::{
    BindingKind, BindingSlot, PipelineDesc, PipelineDescBuilder, PipelineDescBuilderError, PrimitiveTopology,
    ShaderBinary, ShaderProgram, ShaderStage,
};
pub use swapchain::{ImageCountPolicy, PresentMode, SurfaceCapabilities, Swapchain, SwapchainConfig};
pub use synchronization::{Fence, Semaphore};
pub use texture::{Filter, TextureDesc, TextureDimension, TextureUsage};
