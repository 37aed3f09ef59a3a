//! Translates backend-neutral command lists into Vulkan command buffers.

use std::ffi::CString;
use ash::vk;
use gears_core::collections::hashmap::HashMap;
use crate::barrier::{BufferBarrier, TextureBarrier, TextureLayout};
use crate::command::{BoundResource, Command, CommandList, LoadOp};
use crate::error::RhiError;
use crate::handle::TextureHandle;
use crate::vulkan::device::{Objects, Samplers, TextureEntry};
use crate::vulkan::utility;

/// Descriptor pool requirements of a command list: one set per resource binding command.
pub(crate) fn descriptor_pool_sizes(commands: &CommandList) -> (u32, Vec<vk::DescriptorPoolSize>) {
    let mut sets = 0u32;
    let mut counts: HashMap<vk::DescriptorType, u32> = HashMap::default();

    for command in commands {
        let Command::BindResources { bindings, .. } = command else {
            continue;
        };
        sets += 1;
        for binding in bindings {
            *counts.entry(descriptor_type(&binding.resource)).or_default() += 1;
        }
    }

    let sizes = counts
        .into_iter()
        .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
        .collect();
    (sets, sizes)
}

fn descriptor_type(resource: &BoundResource) -> vk::DescriptorType {
    match resource {
        BoundResource::SampledTexture(_) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BoundResource::StorageTexture(_) => vk::DescriptorType::STORAGE_IMAGE,
        BoundResource::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
        BoundResource::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
    }
}

fn subresource_range(entry: &TextureEntry) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(utility::aspect_mask(entry.desc.format))
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(entry.desc.array_layers)
}

fn texture(objects: &Objects, handle: TextureHandle) -> Result<&TextureEntry, RhiError> {
    objects.textures.get(handle).ok_or(RhiError::InvalidHandle("texture"))
}

fn image_barrier(objects: &Objects, barrier: &TextureBarrier) -> Result<vk::ImageMemoryBarrier2<'static>, RhiError> {
    let entry = texture(objects, barrier.texture)?;
    let old_layout = if barrier.discard { TextureLayout::Undefined } else { barrier.old_layout };
    Ok(vk::ImageMemoryBarrier2::default()
        .src_stage_mask(barrier.src_stage.to_vk())
        .src_access_mask(barrier.old_layout.access_flags())
        .dst_stage_mask(barrier.dst_stage.to_vk())
        .dst_access_mask(barrier.new_layout.access_flags())
        .old_layout(old_layout.to_vk())
        .new_layout(barrier.new_layout.to_vk())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(entry.image)
        .subresource_range(subresource_range(entry)))
}

fn buffer_barrier(objects: &Objects, barrier: &BufferBarrier) -> Result<vk::BufferMemoryBarrier2<'static>, RhiError> {
    let entry = objects.buffers.get(barrier.buffer).ok_or(RhiError::InvalidHandle("buffer"))?;
    Ok(vk::BufferMemoryBarrier2::default()
        .src_stage_mask(barrier.src_stage.to_vk())
        .src_access_mask(barrier.src_state.access_flags())
        .dst_stage_mask(barrier.dst_stage.to_vk())
        .dst_access_mask(barrier.dst_state.access_flags())
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(entry.buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE))
}

enum DescriptorInfo {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
}

/// Record `commands` into `cmd`, which must be in the initial state.
pub(crate) fn record_command_list(
    device: &ash::Device,
    debug_utils: Option<&ash::ext::debug_utils::Device>,
    cmd: vk::CommandBuffer,
    commands: &CommandList,
    objects: &Objects,
    samplers: Samplers,
    descriptor_pool: Option<vk::DescriptorPool>,
) -> Result<(), RhiError> {
    unsafe { device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())? };

    for command in commands {
        match command {
            Command::BeginOperation { name } => {
                if let (Some(debug_utils), Ok(name)) = (debug_utils, CString::new(name.as_str())) {
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    unsafe { debug_utils.cmd_begin_debug_utils_label(cmd, &label) };
                }
            }
            Command::EndOperation => {
                if let Some(debug_utils) = debug_utils {
                    unsafe { debug_utils.cmd_end_debug_utils_label(cmd) };
                }
            }
            Command::Barrier { textures, buffers } => {
                let image_barriers = textures
                    .iter()
                    .map(|barrier| image_barrier(objects, barrier))
                    .collect::<Result<Vec<_>, _>>()?;
                let buffer_barriers = buffers
                    .iter()
                    .map(|barrier| buffer_barrier(objects, barrier))
                    .collect::<Result<Vec<_>, _>>()?;
                let dependency = vk::DependencyInfo::default()
                    .image_memory_barriers(&image_barriers)
                    .buffer_memory_barriers(&buffer_barriers);
                unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
            }
            Command::BeginRendering { attachments, extent } => {
                let color_attachments = attachments
                    .iter()
                    .map(|attachment| {
                        let entry = texture(objects, attachment.texture)?;
                        let (load_op, clear) = match attachment.load_op {
                            LoadOp::Load => (vk::AttachmentLoadOp::LOAD, [0.0; 4]),
                            LoadOp::Clear(color) => (vk::AttachmentLoadOp::CLEAR, color),
                            LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, [0.0; 4]),
                        };
                        Ok(vk::RenderingAttachmentInfo::default()
                            .image_view(entry.view)
                            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .load_op(load_op)
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(vk::ClearValue { color: vk::ClearColorValue { float32: clear } }))
                    })
                    .collect::<Result<Vec<_>, RhiError>>()?;
                let render_area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D { width: extent.width, height: extent.height },
                };
                let layer_count = attachments
                    .iter()
                    .filter_map(|attachment| objects.textures.get(attachment.texture))
                    .map(|entry| entry.desc.array_layers)
                    .min()
                    .unwrap_or(1);
                let rendering_info = vk::RenderingInfo::default()
                    .render_area(render_area)
                    .layer_count(layer_count)
                    .color_attachments(&color_attachments);
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: extent.width as f32,
                    height: extent.height as f32,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                unsafe {
                    device.cmd_begin_rendering(cmd, &rendering_info);
                    device.cmd_set_viewport(cmd, 0, &[viewport]);
                    device.cmd_set_scissor(cmd, 0, &[render_area]);
                }
            }
            Command::EndRendering => unsafe { device.cmd_end_rendering(cmd) },
            Command::BindPipeline { pipeline } => {
                let entry = objects.pipelines.get(*pipeline).ok_or(RhiError::InvalidHandle("pipeline"))?;
                unsafe { device.cmd_bind_pipeline(cmd, entry.bind_point, entry.pipeline) };
            }
            Command::BindResources { pipeline, bindings } => {
                let entry = objects.pipelines.get(*pipeline).ok_or(RhiError::InvalidHandle("pipeline"))?;
                let pool = descriptor_pool.ok_or(RhiError::InvalidHandle("descriptor pool"))?;
                let alloc_info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(std::slice::from_ref(&entry.set_layout));
                let set = unsafe { device.allocate_descriptor_sets(&alloc_info)?[0] };

                let infos = bindings
                    .iter()
                    .map(|binding| {
                        let info = match binding.resource {
                            BoundResource::SampledTexture(handle) => {
                                let texture = texture(objects, handle)?;
                                DescriptorInfo::Image(vk::DescriptorImageInfo {
                                    sampler: samplers.get(texture.desc.filter),
                                    image_view: texture.view,
                                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                                })
                            }
                            BoundResource::StorageTexture(handle) => DescriptorInfo::Image(vk::DescriptorImageInfo {
                                sampler: vk::Sampler::null(),
                                image_view: texture(objects, handle)?.view,
                                image_layout: vk::ImageLayout::GENERAL,
                            }),
                            BoundResource::UniformBuffer(handle) | BoundResource::StorageBuffer(handle) => {
                                let buffer = objects.buffers.get(handle).ok_or(RhiError::InvalidHandle("buffer"))?;
                                DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                                    buffer: buffer.buffer,
                                    offset: 0,
                                    range: vk::WHOLE_SIZE,
                                })
                            }
                        };
                        Ok((binding, info))
                    })
                    .collect::<Result<Vec<_>, RhiError>>()?;

                let writes: Vec<vk::WriteDescriptorSet> = infos
                    .iter()
                    .map(|(binding, info)| {
                        let write = vk::WriteDescriptorSet::default()
                            .dst_set(set)
                            .dst_binding(binding.binding)
                            .dst_array_element(binding.element)
                            .descriptor_type(descriptor_type(&binding.resource));
                        match info {
                            DescriptorInfo::Image(image) => write.image_info(std::slice::from_ref(image)),
                            DescriptorInfo::Buffer(buffer) => write.buffer_info(std::slice::from_ref(buffer)),
                        }
                    })
                    .collect();

                unsafe {
                    device.update_descriptor_sets(&writes, &[]);
                    device.cmd_bind_descriptor_sets(cmd, entry.bind_point, entry.layout, 0, &[set], &[]);
                }
            }
            Command::Draw(params) => unsafe {
                device.cmd_draw(cmd, params.vertex_count, params.instance_count, params.first_vertex, params.first_instance)
            },
            Command::Dispatch(params) => unsafe { device.cmd_dispatch(cmd, params.x, params.y, params.z) },
            Command::CopyTexture { src, dst, extent } => {
                let src_entry = texture(objects, *src)?;
                let dst_entry = texture(objects, *dst)?;
                let layers = |entry: &TextureEntry| {
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(utility::aspect_mask(entry.desc.format))
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(src_entry.desc.array_layers.min(dst_entry.desc.array_layers))
                };
                let region = vk::ImageCopy::default()
                    .src_subresource(layers(src_entry))
                    .dst_subresource(layers(dst_entry))
                    .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: extent.depth });
                unsafe {
                    device.cmd_copy_image(
                        cmd,
                        src_entry.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_entry.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
        }
    }

    unsafe { device.end_command_buffer(cmd)? };
    Ok(())
}
