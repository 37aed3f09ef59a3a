//! Opaque handles to backend objects.
//!
//! Handles are versioned arena keys: a handle to a destroyed object never
//! aliases a newer one.

use slotmap::new_key_type;

new_key_type! {
    pub struct FenceHandle;
    pub struct SemaphoreHandle;
    pub struct TextureHandle;
    pub struct BufferHandle;
    pub struct PipelineHandle;
    pub struct CommandPoolHandle;
    pub struct CommandBufferHandle;
}

/// Index of a device queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("queue#{_0}")]
pub struct QueueHandle(pub u32);
