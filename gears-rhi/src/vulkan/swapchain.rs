//! Window surface and presentation.

use std::sync::Arc;
use ash::vk;
use log::info;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use crate::device::RenderDevice;
use crate::error::{RhiError, SwapchainError};
use crate::format::{Extent2D, Format};
use crate::handle::{FenceHandle, SemaphoreHandle, TextureHandle};
use crate::swapchain::{SurfaceCapabilities, Swapchain, SwapchainConfig};
use crate::texture::{TextureDesc, TextureUsage};
use crate::vulkan::core::VulkanCore;
use crate::vulkan::device::VulkanDevice;
use crate::vulkan::utility;

pub struct VulkanSurface {
    _core: Arc<VulkanCore>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
}

impl VulkanSurface {
    pub fn new(core: Arc<VulkanCore>, window: &(impl HasDisplayHandle + HasWindowHandle)) -> Result<Self, RhiError> {
        let display_handle = window
            .display_handle()
            .map_err(|err| RhiError::Initialization(err.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|err| RhiError::Initialization(err.to_string()))?
            .as_raw();

        let surface_loader = ash::khr::surface::Instance::new(core.entry(), core.instance());
        let surface = unsafe {
            ash_window::create_surface(core.entry(), core.instance(), display_handle, window_handle, None)?
        };

        Ok(Self { _core: core, surface_loader, surface })
    }

    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub(crate) fn supports_queue_family(&self, physical_device: vk::PhysicalDevice, family: u32) -> bool {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, family, self.surface)
                .unwrap_or(false)
        }
    }

    fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR, RhiError> {
        Ok(unsafe { self.surface_loader.get_physical_device_surface_capabilities(physical_device, self.surface)? })
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

fn surface_capabilities(capabilities: &vk::SurfaceCapabilitiesKHR) -> SurfaceCapabilities {
    let current_extent = (capabilities.current_extent.width != u32::MAX)
        .then(|| Extent2D::new(capabilities.current_extent.width, capabilities.current_extent.height));
    SurfaceCapabilities {
        min_image_count: capabilities.min_image_count,
        max_image_count: capabilities.max_image_count,
        current_extent,
        min_extent: Extent2D::new(capabilities.min_image_extent.width, capabilities.min_image_extent.height),
        max_extent: Extent2D::new(capabilities.max_image_extent.width, capabilities.max_image_extent.height),
    }
}

/// Swapchain presenting on the device's graphics queue.
pub struct VulkanSwapchain {
    device: Arc<VulkanDevice>,
    surface: VulkanSurface,
    config: SwapchainConfig,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    window_extent: Extent2D,
    extent: Extent2D,
    images: Vec<TextureHandle>,
}

impl VulkanSwapchain {
    #[profiling::function]
    pub fn new(
        core: &VulkanCore,
        device: Arc<VulkanDevice>,
        surface: VulkanSurface,
        window_extent: Extent2D,
        config: SwapchainConfig,
    ) -> Result<Self, RhiError> {
        let physical_device = device.physical_device().handle();
        if !surface.supports_queue_family(physical_device, device.physical_device().graphics_queue_family()) {
            return Err(RhiError::Initialization("graphics queue cannot present to this surface".to_owned()));
        }

        let formats = unsafe {
            surface.surface_loader.get_physical_device_surface_formats(physical_device, surface.surface)?
        };
        let surface_format = choose_surface_format(&formats, config.preferred_format)
            .ok_or_else(|| RhiError::Initialization("surface reports no formats".to_owned()))?;

        let present_modes = unsafe {
            surface.surface_loader.get_physical_device_surface_present_modes(physical_device, surface.surface)?
        };
        let present_mode = choose_present_mode(&present_modes, utility::present_mode(config.preferred_present_mode));

        let swapchain_loader = ash::khr::swapchain::Device::new(core.instance(), device.handle());
        let mut swapchain = Self {
            device,
            surface,
            config,
            swapchain_loader,
            swapchain: vk::SwapchainKHR::null(),
            surface_format,
            present_mode,
            window_extent,
            extent: window_extent,
            images: Vec::new(),
        };
        swapchain.create_or_recreate()?;
        Ok(swapchain)
    }

    /// Size of the window the next recreation should match.
    pub fn set_window_extent(&mut self, extent: Extent2D) {
        self.window_extent = extent;
    }

    fn create_or_recreate(&mut self) -> Result<(), RhiError> {
        let physical_device = self.device.physical_device().handle();
        let raw_capabilities = self.surface.capabilities(physical_device)?;
        let capabilities = surface_capabilities(&raw_capabilities);
        let extent = capabilities.select_extent(self.window_extent);
        let image_count = self.config.image_count.select_image_count(&capabilities);

        info!(
            "Creating swapchain: {:?} {:?}, {}, {} images, {:?}",
            self.surface_format.format, self.surface_format.color_space, extent, image_count, self.present_mode
        );

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle())
            .min_image_count(image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(vk::Extent2D { width: extent.width, height: extent.height })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(raw_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None)? };

        for image in self.images.drain(..) {
            self.device.destroy_texture(image);
        }
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }
        self.swapchain = swapchain;
        self.extent = extent;

        let format = utility::format_from_vk(self.surface_format.format).unwrap_or(self.config.preferred_format);
        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        for (index, image) in images.into_iter().enumerate() {
            let desc = TextureDesc::new_2d(extent.width, extent.height, format)
                .with_name(format!("Swapchain image {index}"))
                .with_usage(TextureUsage::ColorAttachment | TextureUsage::TransferDst);
            self.images.push(self.device.register_swapchain_image(image, desc)?);
        }
        Ok(())
    }
}

impl Swapchain for VulkanSwapchain {
    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn format(&self) -> Format {
        utility::format_from_vk(self.surface_format.format).unwrap_or(self.config.preferred_format)
    }

    fn images(&self) -> &[TextureHandle] {
        &self.images
    }

    fn supports_presenting(&self) -> bool {
        true
    }

    #[profiling::function]
    fn acquire_next_image(
        &mut self,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> Result<u32, SwapchainError> {
        let semaphore = signal.map(|handle| self.device.raw_semaphore(handle)).transpose()?;
        let fence = fence.map(|handle| self.device.raw_fence(handle)).transpose()?;

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore.unwrap_or_default(),
                fence.unwrap_or_default(),
            )
        };
        match result {
            Ok((index, false)) => Ok(index),
            Ok((_, true)) => Err(SwapchainError::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SwapchainError::OutOfDate),
            Err(err) => Err(RhiError::from(err).into()),
        }
    }

    #[profiling::function]
    fn present(&mut self, image_index: u32, wait_semaphores: &[SemaphoreHandle]) -> Result<(), SwapchainError> {
        let wait_semaphores = wait_semaphores
            .iter()
            .map(|handle| self.device.raw_semaphore(*handle))
            .collect::<Result<Vec<_>, RhiError>>()?;
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = self
            .device
            .with_queue(|queue| unsafe { self.swapchain_loader.queue_present(queue, &present_info) });
        match result {
            Ok(false) => Ok(()),
            Ok(true) => Err(SwapchainError::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(SwapchainError::OutOfDate),
            Err(err) => Err(RhiError::from(err).into()),
        }
    }

    fn recreate(&mut self) -> Result<(), SwapchainError> {
        self.device.wait_idle()?;
        self.create_or_recreate()?;
        Ok(())
    }
}

impl Drop for VulkanSwapchain {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::warn!("Wait idle before swapchain destruction failed: {err}");
        }
        for image in self.images.drain(..) {
            self.device.destroy_texture(image);
        }
        unsafe { self.swapchain_loader.destroy_swapchain(self.swapchain, None) };
    }
}

fn choose_surface_format(formats: &[vk::SurfaceFormatKHR], preferred: Format) -> Option<vk::SurfaceFormatKHR> {
    let preferred = utility::vk_format(preferred);
    formats
        .iter()
        .find(|f| f.format == preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        // Guaranteed to be available.
        vk::PresentModeKHR::FIFO
    }
}
