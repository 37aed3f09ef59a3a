use std::sync::Arc;
use std::time::Duration;
use crate::device::RenderDevice;
use crate::error::RhiError;
use crate::handle::{FenceHandle, SemaphoreHandle};

/// Owning fence. Destroyed with its owner.
pub struct Fence {
    device: Arc<dyn RenderDevice>,
    fence: FenceHandle,
}

impl Fence {
    pub fn new(name: &str, device: &Arc<dyn RenderDevice>, signaled: bool) -> Result<Self, RhiError> {
        let fence = device.create_fence(name, signaled)?;
        Ok(Self { device: device.clone(), fence })
    }

    #[inline]
    pub fn handle(&self) -> FenceHandle { self.fence }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), RhiError> {
        self.device.wait_for_fence(self.fence, timeout)
    }

    pub fn reset(&self) -> Result<(), RhiError> {
        self.device.reset_fence(self.fence)
    }

    pub fn is_signaled(&self) -> Result<bool, RhiError> {
        self.device.is_fence_signaled(self.fence)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.fence);
    }
}

/// Owning semaphore. Destroyed with its owner.
pub struct Semaphore {
    device: Arc<dyn RenderDevice>,
    semaphore: SemaphoreHandle,
}

impl Semaphore {
    pub fn new(name: &str, device: &Arc<dyn RenderDevice>) -> Result<Self, RhiError> {
        let semaphore = device.create_semaphore(name)?;
        Ok(Self { device: device.clone(), semaphore })
    }

    #[inline]
    pub fn handle(&self) -> SemaphoreHandle { self.semaphore }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.semaphore);
    }
}
