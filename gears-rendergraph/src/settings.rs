use std::sync::Arc;
use derive_builder::Builder;
use parking_lot::Mutex;
use gears_rhi::{CommandPoolHandle, Extent2D, Format, QueueHandle, RenderDevice, RhiError, Swapchain, TextureHandle};
use crate::connection::ConnectionSet;

/// Snapshot of the swapchain images a graph renders into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainImages {
    pub images: Vec<TextureHandle>,
    pub extent: Extent2D,
    pub format: Format,
}

impl SwapchainImages {
    pub fn of<S: Swapchain + ?Sized>(swapchain: &S) -> Self {
        Self {
            images: swapchain.images().to_vec(),
            extent: swapchain.extent(),
            format: swapchain.format(),
        }
    }

    #[inline]
    pub fn image_count(&self) -> usize { self.images.len() }
}

/// Everything a compile needs besides the graph itself.
///
/// Owns the topology it compiles. Settings move into the graph on compile and
/// are moved out again, adjusted and moved back in on recreate, so device and
/// pool handles are never duplicated.
#[derive(Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct GraphSettings {
    #[builder(default)]
    connection_set: ConnectionSet,
    device: Arc<dyn RenderDevice>,
    #[builder(default = "1")]
    frames_in_flight: u32,
    /// Defaults to the device's graphics queue.
    #[builder(default, setter(strip_option))]
    queue: Option<QueueHandle>,
    #[builder(default, setter(strip_option))]
    swapchain: Option<SwapchainImages>,

    #[builder(setter(skip))]
    command_pool: Mutex<Option<CommandPoolHandle>>,
}

impl GraphSettingsBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.frames_in_flight == Some(0) {
            return Err("frames_in_flight must be at least 1".to_owned());
        }
        Ok(())
    }
}

impl GraphSettings {
    #[inline]
    pub fn device(&self) -> &Arc<dyn RenderDevice> { &self.device }

    #[inline]
    pub fn connection_set(&self) -> &ConnectionSet { &self.connection_set }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 { self.frames_in_flight }

    #[inline]
    pub fn swapchain(&self) -> Option<&SwapchainImages> { self.swapchain.as_ref() }

    pub fn graphics_queue(&self) -> QueueHandle {
        self.queue.unwrap_or_else(|| self.device.graphics_queue())
    }

    /// Pool command buffers of this graph are allocated from. Created on first use.
    pub fn command_pool(&self) -> Result<CommandPoolHandle, RhiError> {
        let mut pool = self.command_pool.lock();
        match *pool {
            Some(pool) => Ok(pool),
            None => {
                let created = self.device.create_command_pool(self.graphics_queue())?;
                *pool = Some(created);
                Ok(created)
            }
        }
    }

    /// Frames in flight for the next compile. Zero is clamped to one.
    pub fn set_frames_in_flight(&mut self, frames_in_flight: u32) {
        self.frames_in_flight = frames_in_flight.max(1);
    }

    pub fn set_swapchain(&mut self, swapchain: Option<SwapchainImages>) {
        self.swapchain = swapchain;
    }
}

impl Drop for GraphSettings {
    fn drop(&mut self) {
        if let Some(pool) = self.command_pool.get_mut().take() {
            self.device.destroy_command_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gears_rhi::headless::HeadlessDevice;

    #[test]
    fn device_is_required() {
        let err = GraphSettingsBuilder::default().frames_in_flight(2u32).build();
        assert!(matches!(err, Err(GraphSettingsBuilderError::UninitializedField("device"))));
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let device: Arc<dyn RenderDevice> = Arc::new(HeadlessDevice::default());
        let err = GraphSettingsBuilder::default().device(device).frames_in_flight(0u32).build();
        assert!(matches!(err, Err(GraphSettingsBuilderError::ValidationError(_))));
    }

    #[test]
    fn defaults_and_lazy_pool() {
        let device: Arc<dyn RenderDevice> = Arc::new(HeadlessDevice::default());
        let settings = GraphSettingsBuilder::default().device(device.clone()).build().unwrap();
        assert_eq!(settings.frames_in_flight(), 1);
        assert_eq!(settings.graphics_queue(), device.graphics_queue());
        assert!(settings.swapchain().is_none());

        let pool = settings.command_pool().unwrap();
        assert_eq!(settings.command_pool().unwrap(), pool);
    }
}
