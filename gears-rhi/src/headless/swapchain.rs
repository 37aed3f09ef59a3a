use std::collections::VecDeque;
use std::sync::Arc;
use derive_builder::Builder;
use log::{debug, warn};
use parking_lot::Mutex;
use crate::device::RenderDevice;
use crate::error::{RhiError, SwapchainError};
use crate::format::{Extent2D, Format};
use crate::handle::{FenceHandle, SemaphoreHandle, TextureHandle};
use crate::headless::HeadlessDevice;
use crate::swapchain::Swapchain;
use crate::texture::TextureDesc;

/// Order in which the presentation engine hands out images.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AcquireOrder {
    #[default]
    RoundRobin,
    /// Cycle through the given indices (taken modulo the image count).
    Scripted(Vec<u32>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleKind {
    OutOfDate,
    Suboptimal,
}

impl From<StaleKind> for SwapchainError {
    fn from(value: StaleKind) -> Self {
        match value {
            StaleKind::OutOfDate => SwapchainError::OutOfDate,
            StaleKind::Suboptimal => SwapchainError::Suboptimal,
        }
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
pub struct HeadlessSwapchainConfig {
    #[builder(default = "Extent2D::new(640, 480)")]
    pub extent: Extent2D,
    #[builder(default = "3")]
    pub image_count: u32,
    #[builder(default = "Format::Bgra8Srgb")]
    pub format: Format,
    #[builder(default = "true")]
    pub supports_presenting: bool,
    #[builder(default)]
    pub acquire_order: AcquireOrder,
}

impl Default for HeadlessSwapchainConfig {
    fn default() -> Self {
        Self {
            extent: Extent2D::new(640, 480),
            image_count: 3,
            format: Format::Bgra8Srgb,
            supports_presenting: true,
            acquire_order: AcquireOrder::RoundRobin,
        }
    }
}

impl HeadlessSwapchainConfig {
    /// A single image that is rendered to but never presented.
    pub fn offscreen(extent: Extent2D, format: Format) -> Self {
        Self {
            extent,
            image_count: 1,
            format,
            supports_presenting: false,
            acquire_order: AcquireOrder::RoundRobin,
        }
    }
}

#[derive(Default)]
struct ControlState {
    acquire_faults: VecDeque<StaleKind>,
    present_faults: VecDeque<StaleKind>,
    pending_resize: Option<(Extent2D, u32)>,
    acquisitions: Vec<u32>,
    presents: Vec<u32>,
    recreate_count: u32,
}

/// Shared handle to steer and observe a [`HeadlessSwapchain`] after it was
/// handed to a renderer.
#[derive(Clone, Default)]
pub struct SwapchainControl {
    state: Arc<Mutex<ControlState>>,
}

impl SwapchainControl {
    /// Make the next acquisition report `kind`.
    pub fn fail_next_acquire(&self, kind: StaleKind) {
        self.state.lock().acquire_faults.push_back(kind);
    }

    /// Make the next presentation report `kind`.
    pub fn fail_next_present(&self, kind: StaleKind) {
        self.state.lock().present_faults.push_back(kind);
    }

    /// Simulate a window resize: the next acquisition is out of date and the
    /// next recreation uses the new extent and image count.
    pub fn resize(&self, extent: Extent2D, image_count: u32) {
        let mut state = self.state.lock();
        state.pending_resize = Some((extent, image_count));
        state.acquire_faults.push_back(StaleKind::OutOfDate);
    }

    /// Image indices returned by successful acquisitions, in order.
    pub fn acquisitions(&self) -> Vec<u32> {
        self.state.lock().acquisitions.clone()
    }

    /// Image indices that were handed to `present`, in order.
    pub fn presents(&self) -> Vec<u32> {
        self.state.lock().presents.clone()
    }

    pub fn recreate_count(&self) -> u32 {
        self.state.lock().recreate_count
    }
}

/// Swapchain whose images are plain headless textures.
pub struct HeadlessSwapchain {
    device: Arc<HeadlessDevice>,
    config: HeadlessSwapchainConfig,
    images: Vec<TextureHandle>,
    cursor: usize,
    control: SwapchainControl,
}

impl HeadlessSwapchain {
    pub fn new(device: Arc<HeadlessDevice>, config: HeadlessSwapchainConfig) -> Result<Self, RhiError> {
        if config.image_count == 0 {
            return Err(RhiError::InvalidDescription("swapchain needs at least one image".to_owned()));
        }
        let mut swapchain = Self {
            device,
            config,
            images: Vec::new(),
            cursor: 0,
            control: SwapchainControl::default(),
        };
        swapchain.create_images()?;
        Ok(swapchain)
    }

    pub fn control(&self) -> SwapchainControl {
        self.control.clone()
    }

    fn create_images(&mut self) -> Result<(), RhiError> {
        let Extent2D { width, height } = self.config.extent;
        for index in 0..self.config.image_count {
            let desc = TextureDesc::new_color_attachment(width, height, self.config.format)
                .with_name(format!("Swapchain image {index}"));
            self.images.push(self.device.create_texture(&desc)?);
        }
        debug!(
            "Headless swapchain: {} images of {} ({:?})",
            self.config.image_count, self.config.extent, self.config.format
        );
        Ok(())
    }

    fn destroy_images(&mut self) {
        for image in self.images.drain(..) {
            self.device.destroy_texture(image);
        }
    }

    fn next_index(&mut self) -> u32 {
        let count = self.config.image_count;
        let index = match &self.config.acquire_order {
            AcquireOrder::RoundRobin => self.cursor as u32 % count,
            AcquireOrder::Scripted(order) if order.is_empty() => self.cursor as u32 % count,
            AcquireOrder::Scripted(order) => order[self.cursor % order.len()] % count,
        };
        self.cursor += 1;
        index
    }
}

impl Swapchain for HeadlessSwapchain {
    fn image_count(&self) -> u32 {
        self.config.image_count
    }

    fn extent(&self) -> Extent2D {
        self.config.extent
    }

    fn format(&self) -> Format {
        self.config.format
    }

    fn images(&self) -> &[TextureHandle] {
        &self.images
    }

    fn supports_presenting(&self) -> bool {
        self.config.supports_presenting
    }

    fn acquire_next_image(
        &mut self,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> Result<u32, SwapchainError> {
        let fault = self.control.state.lock().acquire_faults.pop_front();
        match fault {
            Some(StaleKind::OutOfDate) => return Err(SwapchainError::OutOfDate),
            Some(StaleKind::Suboptimal) => {
                // Suboptimal still acquires, so the sync objects end up signalled.
                let _ = self.next_index();
                self.device.signal_external(fence, signal)?;
                return Err(SwapchainError::Suboptimal);
            }
            None => {}
        }

        let index = self.next_index();
        self.device.signal_external(fence, signal)?;
        self.control.state.lock().acquisitions.push(index);
        Ok(index)
    }

    fn present(&mut self, image_index: u32, wait_semaphores: &[SemaphoreHandle]) -> Result<(), SwapchainError> {
        if !self.config.supports_presenting {
            return Err(SwapchainError::PresentingUnsupported);
        }
        if image_index >= self.config.image_count {
            return Err(RhiError::InvalidHandle("swapchain image").into());
        }
        self.device.consume_semaphores(wait_semaphores)?;

        let mut state = self.control.state.lock();
        state.presents.push(image_index);
        match state.present_faults.pop_front() {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    fn recreate(&mut self) -> Result<(), SwapchainError> {
        if self.device.pending_submissions() != 0 {
            warn!("Recreating headless swapchain while the device is busy");
        }
        self.destroy_images();
        {
            let mut state = self.control.state.lock();
            if let Some((extent, image_count)) = state.pending_resize.take() {
                self.config.extent = extent;
                self.config.image_count = image_count.max(1);
            }
            state.recreate_count += 1;
        }
        self.cursor = 0;
        self.create_images()?;
        Ok(())
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        self.destroy_images();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDeviceConfig;

    fn device() -> Arc<HeadlessDevice> {
        Arc::new(HeadlessDevice::new(HeadlessDeviceConfig::default()))
    }

    #[test]
    fn round_robin_acquisition() {
        let device = device();
        let mut swapchain = HeadlessSwapchain::new(device.clone(), HeadlessSwapchainConfig::default()).unwrap();
        let semaphore = device.create_semaphore("image available").unwrap();

        let mut indices = Vec::new();
        for _ in 0..4 {
            indices.push(swapchain.acquire_next_image(Some(semaphore), None).unwrap());
            device.consume_semaphores(&[semaphore]).unwrap();
        }
        assert_eq!(indices, vec![0, 1, 2, 0]);
        assert_eq!(swapchain.control().acquisitions(), indices);
    }

    #[test]
    fn scripted_order_wraps() {
        let device = device();
        let config = HeadlessSwapchainConfigBuilder::default()
            .image_count(2u32)
            .acquire_order(AcquireOrder::Scripted(vec![1, 1, 0]))
            .build()
            .unwrap();
        let mut swapchain = HeadlessSwapchain::new(device, config).unwrap();

        let indices: Vec<u32> = (0..4).map(|_| swapchain.acquire_next_image(None, None).unwrap()).collect();
        assert_eq!(indices, vec![1, 1, 0, 1]);
    }

    #[test]
    fn resize_is_applied_on_recreate() {
        let device = device();
        let mut swapchain = HeadlessSwapchain::new(device.clone(), HeadlessSwapchainConfig::default()).unwrap();
        let control = swapchain.control();
        assert_eq!(device.live_texture_count(), 3);

        control.resize(Extent2D::new(320, 200), 2);
        assert!(matches!(swapchain.acquire_next_image(None, None), Err(SwapchainError::OutOfDate)));

        swapchain.recreate().unwrap();
        assert_eq!(swapchain.extent(), Extent2D::new(320, 200));
        assert_eq!(swapchain.image_count(), 2);
        assert_eq!(device.live_texture_count(), 2);
        assert_eq!(control.recreate_count(), 1);
        assert_eq!(swapchain.acquire_next_image(None, None).unwrap(), 0);
    }

    #[test]
    fn present_consumes_semaphores_even_when_stale() {
        let device = device();
        let mut swapchain = HeadlessSwapchain::new(device.clone(), HeadlessSwapchainConfig::default()).unwrap();
        let semaphore = device.create_semaphore("render finished").unwrap();
        device.signal_external(None, Some(semaphore)).unwrap();

        swapchain.control().fail_next_present(StaleKind::Suboptimal);
        let err = swapchain.present(0, &[semaphore]).unwrap_err();
        assert!(err.is_stale());
        assert!(device.consume_semaphores(&[semaphore]).is_err());
        assert_eq!(swapchain.control().presents(), vec![0]);
    }

    #[test]
    fn offscreen_swapchain_cannot_present() {
        let device = device();
        let config = HeadlessSwapchainConfig::offscreen(Extent2D::new(16, 16), Format::Rgba8Unorm);
        let mut swapchain = HeadlessSwapchain::new(device, config).unwrap();
        assert_eq!(swapchain.image_count(), 1);
        assert!(matches!(swapchain.present(0, &[]), Err(SwapchainError::PresentingUnsupported)));
    }
}
