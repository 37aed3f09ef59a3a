//! Presentation contract and swapchain settings.

use crate::error::SwapchainError;
use crate::format::{Extent2D, Format};
use crate::handle::{FenceHandle, SemaphoreHandle, TextureHandle};

/// The rotating set of displayable images owned by the presentation engine.
pub trait Swapchain: Send {
    fn image_count(&self) -> u32;

    fn extent(&self) -> Extent2D;

    fn format(&self) -> Format;

    /// Textures backing the swapchain images, indexed by image index.
    fn images(&self) -> &[TextureHandle];

    /// `false` for offscreen swapchains that only render.
    fn supports_presenting(&self) -> bool;

    /// Acquire the next image. `signal` and `fence` are signalled once the
    /// presentation engine released the image.
    fn acquire_next_image(
        &mut self,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> Result<u32, SwapchainError>;

    fn present(&mut self, image_index: u32, wait_semaphores: &[SemaphoreHandle]) -> Result<(), SwapchainError>;

    /// Rebuild the image set for the current surface. The device must be idle.
    fn recreate(&mut self) -> Result<(), SwapchainError>;
}

/// What the surface allows, as reported by the windowing system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means unbounded.
    pub max_image_count: u32,
    /// `None` when the swapchain decides the extent.
    pub current_extent: Option<Extent2D>,
    pub min_extent: Extent2D,
    pub max_extent: Extent2D,
}

impl SurfaceCapabilities {
    /// Extent the swapchain should use given the window size.
    pub fn select_extent(&self, window_extent: Extent2D) -> Extent2D {
        match self.current_extent {
            Some(extent) => extent,
            None => Extent2D::new(
                window_extent.width.clamp(self.min_extent.width, self.max_extent.width),
                window_extent.height.clamp(self.min_extent.height, self.max_extent.height),
            ),
        }
    }
}

/// How many swapchain images to request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageCountPolicy {
    /// Three images when the surface allows it, otherwise the surface minimum.
    #[default]
    Default,
    /// One image, or the surface minimum when it is larger.
    SingleImage,
    /// As many images as the surface allows.
    MaxImages,
}

impl ImageCountPolicy {
    pub fn select_image_count(self, capabilities: &SurfaceCapabilities) -> u32 {
        let unbounded = capabilities.max_image_count == 0;
        match self {
            ImageCountPolicy::Default => {
                if capabilities.min_image_count < 3 && (unbounded || 3 <= capabilities.max_image_count) {
                    3
                } else {
                    capabilities.min_image_count
                }
            }
            ImageCountPolicy::SingleImage => capabilities.min_image_count.max(1),
            ImageCountPolicy::MaxImages => {
                if unbounded {
                    capabilities.min_image_count + 1
                } else {
                    capabilities.max_image_count
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PresentMode {
    /// Vertical-sync locked queue; always available.
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

/// Swapchain configuration parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub preferred_format: Format,
    pub preferred_present_mode: PresentMode,
    pub image_count: ImageCountPolicy,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            preferred_format: Format::Bgra8Srgb,
            preferred_present_mode: PresentMode::Fifo,
            image_count: ImageCountPolicy::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: min,
            max_image_count: max,
            current_extent: None,
            min_extent: Extent2D::new(1, 1),
            max_extent: Extent2D::new(4096, 4096),
        }
    }

    #[test]
    fn default_policy_prefers_three() {
        assert_eq!(ImageCountPolicy::Default.select_image_count(&caps(2, 8)), 3);
        assert_eq!(ImageCountPolicy::Default.select_image_count(&caps(2, 0)), 3);
        assert_eq!(ImageCountPolicy::Default.select_image_count(&caps(2, 2)), 2);
        assert_eq!(ImageCountPolicy::Default.select_image_count(&caps(4, 8)), 4);
    }

    #[test]
    fn single_and_max_policies() {
        assert_eq!(ImageCountPolicy::SingleImage.select_image_count(&caps(1, 8)), 1);
        assert_eq!(ImageCountPolicy::SingleImage.select_image_count(&caps(2, 8)), 2);
        assert_eq!(ImageCountPolicy::MaxImages.select_image_count(&caps(2, 8)), 8);
        assert_eq!(ImageCountPolicy::MaxImages.select_image_count(&caps(2, 0)), 3);
    }

    #[test]
    fn extent_is_clamped_when_surface_defers() {
        let capabilities = caps(2, 3);
        assert_eq!(capabilities.select_extent(Extent2D::new(10_000, 0)), Extent2D::new(4096, 1));

        let fixed = SurfaceCapabilities { current_extent: Some(Extent2D::new(800, 600)), ..capabilities };
        assert_eq!(fixed.select_extent(Extent2D::new(1, 1)), Extent2D::new(800, 600));
    }
}
