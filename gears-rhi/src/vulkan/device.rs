//! Vulkan logical device.

use std::sync::Arc;
use std::time::Duration;
use ash::vk;
use log::{debug, info, warn};
use parking_lot::Mutex;
use slotmap::SlotMap;
use crate::buffer::{BufferDesc, MemoryLocation};
use crate::command::CommandList;
use crate::device::{DeviceFeatures, RenderDevice, SubmitInfo};
use crate::error::RhiError;
use crate::handle::{
    BufferHandle, CommandBufferHandle, CommandPoolHandle, FenceHandle, PipelineHandle, QueueHandle,
    SemaphoreHandle, TextureHandle,
};
use crate::pipeline::PipelineDesc;
use crate::texture::{Filter, TextureDesc};
use crate::vulkan::command::{descriptor_pool_sizes, record_command_list};
use crate::vulkan::core::{PhysicalDevice, VulkanCore};
use crate::vulkan::pipeline::{create_pipeline, PipelineEntry};
use crate::vulkan::utility;

pub(crate) struct TextureEntry {
    pub desc: TextureDesc,
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// `None` for images owned by a swapchain.
    pub memory: Option<vk::DeviceMemory>,
}

pub(crate) struct BufferEntry {
    pub desc: BufferDesc,
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
}

pub(crate) struct CommandBufferEntry {
    pub pool: CommandPoolHandle,
    pub buffer: vk::CommandBuffer,
    pub descriptor_pool: Option<vk::DescriptorPool>,
}

#[derive(Default)]
pub(crate) struct Objects {
    pub fences: SlotMap<FenceHandle, vk::Fence>,
    pub semaphores: SlotMap<SemaphoreHandle, vk::Semaphore>,
    pub textures: SlotMap<TextureHandle, TextureEntry>,
    pub buffers: SlotMap<BufferHandle, BufferEntry>,
    pub pipelines: SlotMap<PipelineHandle, PipelineEntry>,
    pub pools: SlotMap<CommandPoolHandle, vk::CommandPool>,
    pub command_buffers: SlotMap<CommandBufferHandle, CommandBufferEntry>,
}

/// Samplers shared by every sampled texture binding.
#[derive(Clone, Copy)]
pub(crate) struct Samplers {
    nearest: vk::Sampler,
    linear: vk::Sampler,
}

impl Samplers {
    pub fn get(&self, filter: Filter) -> vk::Sampler {
        match filter {
            Filter::Nearest => self.nearest,
            Filter::Linear => self.linear,
        }
    }
}

pub struct VulkanDevice {
    // Keeps the instance alive for as long as the device.
    _core: Arc<VulkanCore>,
    physical_device: PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_lock: Mutex<()>,
    samplers: Samplers,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    objects: Mutex<Objects>,
}

impl VulkanDevice {
    #[profiling::function]
    pub fn new(core: Arc<VulkanCore>, physical_device: PhysicalDevice) -> Result<Self, RhiError> {
        let queue_priority = 1.0f32;
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical_device.graphics_queue_family())
            .queue_priorities(std::slice::from_ref(&queue_priority));

        let extensions = [ash::khr::swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();
        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vulkan_13_features);

        let device = unsafe { core.instance().create_device(physical_device.handle(), &create_info, None)? };
        let queue = unsafe { device.get_device_queue(physical_device.graphics_queue_family(), 0) };

        let samplers = Samplers {
            nearest: create_sampler(&device, Filter::Nearest)?,
            linear: create_sampler(&device, Filter::Linear)?,
        };

        let debug_utils = cfg!(feature = "validation")
            .then(|| ash::ext::debug_utils::Device::new(core.instance(), &device));

        info!("Created Vulkan device on {}", physical_device.name());
        Ok(Self {
            _core: core,
            physical_device,
            device,
            queue,
            queue_lock: Mutex::new(()),
            samplers,
            debug_utils,
            objects: Mutex::new(Objects::default()),
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    pub(crate) fn raw_semaphore(&self, semaphore: SemaphoreHandle) -> Result<vk::Semaphore, RhiError> {
        self.objects.lock().semaphores.get(semaphore).copied().ok_or(RhiError::InvalidHandle("semaphore"))
    }

    pub(crate) fn raw_fence(&self, fence: FenceHandle) -> Result<vk::Fence, RhiError> {
        self.objects.lock().fences.get(fence).copied().ok_or(RhiError::InvalidHandle("fence"))
    }

    /// Run `f` with exclusive access to the graphics queue.
    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _guard = self.queue_lock.lock();
        f(self.queue)
    }

    /// Make a swapchain image addressable through a [`TextureHandle`].
    pub(crate) fn register_swapchain_image(&self, image: vk::Image, desc: TextureDesc) -> Result<TextureHandle, RhiError> {
        let view = create_view(&self.device, image, &desc)?;
        Ok(self.objects.lock().textures.insert(TextureEntry { desc, image, view, memory: None }))
    }

    fn allocate(&self, requirements: vk::MemoryRequirements, flags: vk::MemoryPropertyFlags) -> Result<vk::DeviceMemory, RhiError> {
        let memory_type_index = utility::find_memory_type(
            self.physical_device.memory_properties(),
            requirements.memory_type_bits,
            flags,
        )
        .ok_or(RhiError::OutOfMemory)?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        Ok(unsafe { self.device.allocate_memory(&alloc_info, None)? })
    }

    fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        if let Err(err) = unsafe { debug_utils.set_debug_utils_object_name(&info) } {
            warn!("Failed to set debug name {:?}: {}", name, err);
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                warn!("Device wait idle failed on shutdown: {err}");
            }
            let objects = self.objects.get_mut();
            for (_, entry) in objects.command_buffers.drain() {
                if let Some(pool) = entry.descriptor_pool {
                    self.device.destroy_descriptor_pool(pool, None);
                }
            }
            for (_, pool) in objects.pools.drain() {
                self.device.destroy_command_pool(pool, None);
            }
            for (_, pipeline) in objects.pipelines.drain() {
                pipeline.destroy(&self.device);
            }
            for (_, texture) in objects.textures.drain() {
                destroy_texture(&self.device, texture);
            }
            for (_, buffer) in objects.buffers.drain() {
                self.device.destroy_buffer(buffer.buffer, None);
                self.device.free_memory(buffer.memory, None);
            }
            for (_, semaphore) in objects.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, fence) in objects.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            self.device.destroy_sampler(self.samplers.nearest, None);
            self.device.destroy_sampler(self.samplers.linear, None);
            self.device.destroy_device(None);
        }
    }
}

impl RenderDevice for VulkanDevice {
    fn name(&self) -> &str {
        self.physical_device.name()
    }

    fn features(&self) -> DeviceFeatures {
        DeviceFeatures { compute: true, storage_textures: true, texture_3d: true }
    }

    fn graphics_queue(&self) -> QueueHandle {
        QueueHandle(0)
    }

    fn create_command_pool(&self, queue: QueueHandle) -> Result<CommandPoolHandle, RhiError> {
        if queue != self.graphics_queue() {
            return Err(RhiError::InvalidHandle("queue"));
        }
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.physical_device.graphics_queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&create_info, None)? };
        Ok(self.objects.lock().pools.insert(pool))
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut objects = self.objects.lock();
        let Some(raw) = objects.pools.remove(pool) else {
            return;
        };
        let freed: Vec<CommandBufferHandle> = objects
            .command_buffers
            .iter()
            .filter(|(_, entry)| entry.pool == pool)
            .map(|(handle, _)| handle)
            .collect();
        for handle in freed {
            if let Some(entry) = objects.command_buffers.remove(handle) {
                if let Some(descriptor_pool) = entry.descriptor_pool {
                    unsafe { self.device.destroy_descriptor_pool(descriptor_pool, None) };
                }
            }
        }
        unsafe { self.device.destroy_command_pool(raw, None) };
    }

    fn create_fence(&self, name: &str, signaled: bool) -> Result<FenceHandle, RhiError> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(flags), None)? };
        self.set_debug_name(fence, name);
        Ok(self.objects.lock().fences.insert(fence))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(raw) = self.objects.lock().fences.remove(fence) {
            unsafe { self.device.destroy_fence(raw, None) };
        }
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> Result<(), RhiError> {
        let raw = self.raw_fence(fence)?;
        match unsafe { self.device.wait_for_fences(&[raw], true, utility::timeout_ns(timeout)) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RhiError::Timeout(timeout.unwrap_or(Duration::MAX))),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RhiError::DeviceLost),
            Err(err) => Err(err.into()),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), RhiError> {
        let raw = self.raw_fence(fence)?;
        unsafe { self.device.reset_fences(&[raw])? };
        Ok(())
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> Result<bool, RhiError> {
        let raw = self.raw_fence(fence)?;
        Ok(unsafe { self.device.get_fence_status(raw)? })
    }

    fn create_semaphore(&self, name: &str) -> Result<SemaphoreHandle, RhiError> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        self.set_debug_name(semaphore, name);
        Ok(self.objects.lock().semaphores.insert(semaphore))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(raw) = self.objects.lock().semaphores.remove(semaphore) {
            unsafe { self.device.destroy_semaphore(raw, None) };
        }
    }

    #[profiling::function]
    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureHandle, RhiError> {
        let extent = vk::Extent3D { width: desc.extent.width, height: desc.extent.height, depth: desc.extent.depth };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(utility::image_type(desc.dimension))
            .format(utility::vk_format(desc.format))
            .extent(extent)
            .mip_levels(1)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(utility::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { self.device.create_image(&image_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let memory = self.allocate(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        unsafe { self.device.bind_image_memory(image, memory, 0)? };
        let view = create_view(&self.device, image, desc)?;
        self.set_debug_name(image, &desc.name);

        Ok(self.objects.lock().textures.insert(TextureEntry {
            desc: desc.clone(),
            image,
            view,
            memory: Some(memory),
        }))
    }

    fn destroy_texture(&self, texture: TextureHandle) {
        if let Some(entry) = self.objects.lock().textures.remove(texture) {
            destroy_texture(&self.device, entry);
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle, RhiError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(utility::buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let flags = match desc.location {
            MemoryLocation::Gpu => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::Cpu => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        };
        let memory = self.allocate(requirements, flags)?;
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0)? };
        self.set_debug_name(buffer, &desc.name);

        Ok(self.objects.lock().buffers.insert(BufferEntry { desc: desc.clone(), buffer, memory }))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(entry) = self.objects.lock().buffers.remove(buffer) {
            unsafe {
                self.device.destroy_buffer(entry.buffer, None);
                self.device.free_memory(entry.memory, None);
            }
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), RhiError> {
        let objects = self.objects.lock();
        let entry = objects.buffers.get(buffer).ok_or(RhiError::InvalidHandle("buffer"))?;
        if entry.desc.location != MemoryLocation::Cpu {
            return Err(RhiError::BufferNotHostVisible);
        }
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > entry.desc.size) {
            return Err(RhiError::BufferWriteOutOfRange { offset, len: data.len(), size: entry.desc.size });
        }
        unsafe {
            let ptr = self.device.map_memory(entry.memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(entry.memory);
        }
        Ok(())
    }

    #[profiling::function]
    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle, RhiError> {
        let entry = create_pipeline(&self.device, desc)?;
        self.set_debug_name(entry.pipeline, &desc.name);
        debug!("Created pipeline \"{}\"", desc.name);
        Ok(self.objects.lock().pipelines.insert(entry))
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(entry) = self.objects.lock().pipelines.remove(pipeline) {
            unsafe { entry.destroy(&self.device) };
        }
    }

    #[profiling::function]
    fn create_command_buffer(&self, pool: CommandPoolHandle, commands: &CommandList) -> Result<CommandBufferHandle, RhiError> {
        let mut objects = self.objects.lock();
        let raw_pool = *objects.pools.get(pool).ok_or(RhiError::InvalidHandle("command pool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(raw_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)?[0] };

        let (max_sets, pool_sizes) = descriptor_pool_sizes(commands);
        let descriptor_pool = if max_sets > 0 {
            let create_info = vk::DescriptorPoolCreateInfo::default().max_sets(max_sets).pool_sizes(&pool_sizes);
            Some(unsafe { self.device.create_descriptor_pool(&create_info, None)? })
        } else {
            None
        };

        let recorded = record_command_list(
            &self.device,
            self.debug_utils.as_ref(),
            buffer,
            commands,
            &objects,
            self.samplers,
            descriptor_pool,
        );
        if let Err(err) = recorded {
            unsafe {
                self.device.free_command_buffers(raw_pool, &[buffer]);
                if let Some(descriptor_pool) = descriptor_pool {
                    self.device.destroy_descriptor_pool(descriptor_pool, None);
                }
            }
            return Err(err);
        }
        self.set_debug_name(buffer, commands.name());

        Ok(objects.command_buffers.insert(CommandBufferEntry { pool, buffer, descriptor_pool }))
    }

    fn free_command_buffer(&self, pool: CommandPoolHandle, command_buffer: CommandBufferHandle) {
        let mut objects = self.objects.lock();
        let Some(entry) = objects.command_buffers.remove(command_buffer) else {
            return;
        };
        unsafe {
            if let Some(raw_pool) = objects.pools.get(pool) {
                self.device.free_command_buffers(*raw_pool, &[entry.buffer]);
            }
            if let Some(descriptor_pool) = entry.descriptor_pool {
                self.device.destroy_descriptor_pool(descriptor_pool, None);
            }
        }
    }

    #[profiling::function]
    fn submit(&self, queue: QueueHandle, info: &SubmitInfo<'_>) -> Result<(), RhiError> {
        if queue != self.graphics_queue() {
            return Err(RhiError::InvalidHandle("queue"));
        }
        let objects = self.objects.lock();
        let command_buffers = info
            .command_buffers
            .iter()
            .map(|handle| {
                let entry = objects.command_buffers.get(*handle).ok_or(RhiError::InvalidHandle("command buffer"))?;
                Ok(vk::CommandBufferSubmitInfo::default().command_buffer(entry.buffer))
            })
            .collect::<Result<Vec<_>, RhiError>>()?;
        let semaphore_info = |handle: &SemaphoreHandle, stage: vk::PipelineStageFlags2| {
            let semaphore = objects.semaphores.get(*handle).ok_or(RhiError::InvalidHandle("semaphore"))?;
            Ok(vk::SemaphoreSubmitInfo::default().semaphore(*semaphore).stage_mask(stage))
        };
        let waits = info
            .wait_semaphores
            .iter()
            .map(|handle| semaphore_info(handle, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT))
            .collect::<Result<Vec<_>, RhiError>>()?;
        let signals = info
            .signal_semaphores
            .iter()
            .map(|handle| semaphore_info(handle, vk::PipelineStageFlags2::ALL_COMMANDS))
            .collect::<Result<Vec<_>, RhiError>>()?;
        let fence = match info.fence {
            Some(fence) => *objects.fences.get(fence).ok_or(RhiError::InvalidHandle("fence"))?,
            None => vk::Fence::null(),
        };
        drop(objects);

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffers)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);
        self.with_queue(|queue| unsafe { self.device.queue_submit2(queue, &[submit_info], fence) })?;
        Ok(())
    }

    fn wait_queue_idle(&self, queue: QueueHandle) -> Result<(), RhiError> {
        if queue != self.graphics_queue() {
            return Err(RhiError::InvalidHandle("queue"));
        }
        self.with_queue(|queue| unsafe { self.device.queue_wait_idle(queue) })?;
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), RhiError> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

fn create_sampler(device: &ash::Device, filter: Filter) -> Result<vk::Sampler, RhiError> {
    let filter = utility::filter(filter);
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(vk::LOD_CLAMP_NONE);
    Ok(unsafe { device.create_sampler(&create_info, None)? })
}

fn create_view(device: &ash::Device, image: vk::Image, desc: &TextureDesc) -> Result<vk::ImageView, RhiError> {
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(utility::aspect_mask(desc.format))
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(desc.array_layers);
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(utility::view_type(desc.dimension, desc.array_layers))
        .format(utility::vk_format(desc.format))
        .subresource_range(range);
    Ok(unsafe { device.create_image_view(&create_info, None)? })
}

fn destroy_texture(device: &ash::Device, entry: TextureEntry) {
    unsafe {
        device.destroy_image_view(entry.view, None);
        if let Some(memory) = entry.memory {
            device.destroy_image(entry.image, None);
            device.free_memory(memory, None);
        }
    }
}
