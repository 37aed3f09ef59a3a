//! CPU-only backend.
//!
//! Executes nothing but tracks every object and queue operation, so the
//! render graph and the renderers can run (and be tested) without a GPU.

mod device;
mod swapchain;

pub use device::{DeviceEvent, HeadlessDevice, HeadlessDeviceConfig, HeadlessDeviceConfigBuilder};
pub use swapchain::{
    AcquireOrder, HeadlessSwapchain, HeadlessSwapchainConfig, HeadlessSwapchainConfigBuilder,
    StaleKind, SwapchainControl,
};
