//! Vulkan instance and physical device selection.

use std::ffi::{c_char, CStr};
use ash::{vk, Entry, Instance};
use log::info;
use raw_window_handle::RawDisplayHandle;
use crate::error::RhiError;
use crate::vulkan::swapchain::VulkanSurface;

#[cfg(feature = "validation")]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_PER_GB_VRAM: u32 = 100;
const SCORE_VULKAN_1_4: u32 = 600;
const SCORE_VULKAN_1_3: u32 = 400;

#[derive(Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    name: String,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_queue_family: u32,
}

impl PhysicalDevice {
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// A family that supports graphics, compute and (when a surface was
    /// given) presentation.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }
}

/// Global entry point for Vulkan initialization.
pub struct VulkanCore {
    entry: Entry,
    instance: Instance,

    #[cfg(feature = "validation")]
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanCore {
    /// Create an instance able to present to `display`, or a purely
    /// offscreen one when `display` is `None`.
    #[profiling::function]
    pub fn new(application_name: &CStr, display: Option<RawDisplayHandle>) -> Result<Self, RhiError> {
        let entry = unsafe { Entry::load() }.map_err(|err| RhiError::Initialization(err.to_string()))?;
        let instance = create_instance(&entry, application_name, display)?;

        #[cfg(feature = "validation")]
        let debug_utils = match setup_debug_messenger(&entry, &instance) {
            Ok(debug_utils) => Some(debug_utils),
            Err(err) => {
                log::warn!("Failed to create debug messenger: {err}");
                None
            }
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_utils,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Pick the highest scoring GPU that can render (and present to
    /// `surface`, when given).
    pub fn select_physical_device(&self, surface: Option<&VulkanSurface>) -> Result<PhysicalDevice, RhiError> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices()? };

        let mut best_device = None;
        let mut best_device_score = 0u32;

        for device in physical_devices {
            let properties = unsafe { self.instance.get_physical_device_properties(device) };
            let memory_properties = unsafe { self.instance.get_physical_device_memory_properties(device) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy().into_owned();

            let Some(graphics_queue_family) = find_queue_family(&self.instance, device, surface) else {
                info!("Skipping GPU {name}: no suitable queue family");
                continue;
            };
            let score = score_physical_device(&properties, &memory_properties);
            info!("Found GPU: {} (score: {}, type: {:?})", name, score, properties.device_type);

            if score > best_device_score {
                best_device = Some(PhysicalDevice {
                    handle: device,
                    name,
                    properties,
                    memory_properties,
                    graphics_queue_family,
                });
                best_device_score = score;
            }
        }

        best_device.ok_or_else(|| RhiError::Initialization("no suitable GPU found".to_owned()))
    }
}

impl Drop for VulkanCore {
    fn drop(&mut self) {
        unsafe {
            #[cfg(feature = "validation")]
            if let Some((debug_utils, messenger)) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &Entry, application_name: &CStr, display: Option<RawDisplayHandle>) -> Result<Instance, RhiError> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(application_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"Gears")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const c_char> = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)?.to_vec(),
        None => Vec::new(),
    };
    #[cfg(feature = "validation")]
    extensions.push(ash::ext::debug_utils::NAME.as_ptr());

    #[cfg(feature = "validation")]
    let layers = [VALIDATION_LAYER.as_ptr()];
    #[cfg(not(feature = "validation"))]
    let layers: [*const c_char; 0] = [];

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

#[cfg(feature = "validation")]
fn setup_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), vk::Result> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((debug_utils, messenger))
}

#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let message = unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("Vulkan {}: {}", type_str, message),
        _ => log::debug!("Vulkan {}: {}", type_str, message),
    }

    vk::FALSE
}

fn find_queue_family(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<&VulkanSurface>,
) -> Option<u32> {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;

    queue_families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        if !family.queue_flags.contains(required) {
            return None;
        }
        let presents = surface.is_none_or(|surface| surface.supports_queue_family(physical_device, index));
        presents.then_some(index)
    })
}

fn score_physical_device(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> u32 {
    // Dynamic rendering and synchronization2 are core in 1.3.
    if properties.api_version < vk::API_VERSION_1_3 {
        return 0;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 500,
        vk::PhysicalDeviceType::CPU => 100,
        _ => 10,
    };

    score += if properties.api_version >= vk::make_api_version(0, 1, 4, 0) {
        SCORE_VULKAN_1_4
    } else {
        SCORE_VULKAN_1_3
    };

    let vram_bytes: u64 = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    score + (vram_bytes / (1024 * 1024 * 1024)) as u32 * SCORE_PER_GB_VRAM
}
