//! Vulkan 1.3 backend using dynamic rendering and synchronization2.

mod command;
mod core;
mod device;
mod pipeline;
mod swapchain;
mod utility;

pub use self::core::{PhysicalDevice, VulkanCore};
pub use device::VulkanDevice;
pub use swapchain::{VulkanSurface, VulkanSwapchain};
