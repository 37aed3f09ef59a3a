use std::time::Duration;

/// Device level failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RhiError {
    #[error("Timed out after {0:?} waiting for a fence")]
    Timeout(Duration),
    #[error("Device lost")]
    DeviceLost,
    #[error("Out of device memory")]
    OutOfMemory,
    #[error("Invalid {0} handle")]
    InvalidHandle(&'static str),
    #[error("Fence \"{0}\" is unsignaled and has no pending submission")]
    FenceNeverSignaled(String),
    #[error("Fence \"{0}\" is still used by a pending submission")]
    FenceInUse(String),
    #[error("Semaphore \"{0}\" is waited on without a pending signal")]
    SemaphoreNotSignaled(String),
    #[error("Semaphore \"{0}\" is signalled again before being waited on")]
    SemaphoreAlreadySignaled(String),
    #[error("Command buffer is still in use by a pending submission")]
    CommandBufferInUse,
    #[error("Missing device feature: {0}")]
    MissingFeature(&'static str),
    #[error("Pipeline \"{name}\" creation failed: {reason}")]
    PipelineCreation { name: String, reason: String },
    #[error("Buffer write of {len} bytes at offset {offset} exceeds size {size}")]
    BufferWriteOutOfRange { offset: u64, len: usize, size: u64 },
    #[error("Buffer is not host visible")]
    BufferNotHostVisible,
    #[error("Invalid description: {0}")]
    InvalidDescription(String),
    #[error("Initialization failed: {0}")]
    Initialization(String),
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),
}

/// Result of acquire/present that the caller has to react to.
#[derive(Debug, thiserror::Error)]
pub enum SwapchainError {
    /// The surface changed and the swapchain can no longer present.
    #[error("Swapchain is out of date")]
    OutOfDate,
    /// The swapchain still works but no longer matches the surface.
    #[error("Swapchain is suboptimal")]
    Suboptimal,
    #[error("Swapchain does not support presenting")]
    PresentingUnsupported,
    #[error(transparent)]
    Device(#[from] RhiError),
}

impl SwapchainError {
    /// Whether the swapchain has to be recreated before the next frame.
    pub fn is_stale(&self) -> bool {
        matches!(self, SwapchainError::OutOfDate | SwapchainError::Suboptimal)
    }
}
