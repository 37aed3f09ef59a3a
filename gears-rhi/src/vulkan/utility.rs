use ash::vk;
use enumflags2::BitFlags;
use crate::buffer::BufferUsage;
use crate::format::Format;
use crate::pipeline::{BindingKind, PrimitiveTopology, ShaderStage};
use crate::swapchain::PresentMode;
use crate::texture::{Filter, TextureDimension, TextureUsage};

/// Find a suitable memory type index.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let memory_type = memory_properties.memory_types[i as usize];
        (type_filter & (1 << i)) != 0 && memory_type.property_flags.contains(properties)
    })
}

pub(crate) fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
    }
}

pub(crate) fn format_from_vk(format: vk::Format) -> Option<Format> {
    Some(match format {
        vk::Format::R8_UNORM => Format::R8Unorm,
        vk::Format::R32_SFLOAT => Format::R32Float,
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        vk::Format::R32G32B32A32_SFLOAT => Format::Rgba32Float,
        vk::Format::D32_SFLOAT => Format::D32Float,
        _ => return None,
    })
}

pub(crate) fn aspect_mask(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub(crate) fn image_usage(usage: BitFlags<TextureUsage>) -> vk::ImageUsageFlags {
    usage.iter().fold(vk::ImageUsageFlags::empty(), |acc, usage| {
        acc | match usage {
            TextureUsage::Sampled => vk::ImageUsageFlags::SAMPLED,
            TextureUsage::Storage => vk::ImageUsageFlags::STORAGE,
            TextureUsage::ColorAttachment => vk::ImageUsageFlags::COLOR_ATTACHMENT,
            TextureUsage::DepthStencilAttachment => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            TextureUsage::TransferSrc => vk::ImageUsageFlags::TRANSFER_SRC,
            TextureUsage::TransferDst => vk::ImageUsageFlags::TRANSFER_DST,
        }
    })
}

pub(crate) fn buffer_usage(usage: BitFlags<BufferUsage>) -> vk::BufferUsageFlags {
    usage.iter().fold(vk::BufferUsageFlags::empty(), |acc, usage| {
        acc | match usage {
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::TransferSrc => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::TransferDst => vk::BufferUsageFlags::TRANSFER_DST,
        }
    })
}

pub(crate) fn image_type(dimension: TextureDimension) -> vk::ImageType {
    match dimension {
        TextureDimension::D1 => vk::ImageType::TYPE_1D,
        TextureDimension::D2 => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

pub(crate) fn view_type(dimension: TextureDimension, array_layers: u32) -> vk::ImageViewType {
    match (dimension, array_layers > 1) {
        (TextureDimension::D1, false) => vk::ImageViewType::TYPE_1D,
        (TextureDimension::D1, true) => vk::ImageViewType::TYPE_1D_ARRAY,
        (TextureDimension::D2, false) => vk::ImageViewType::TYPE_2D,
        (TextureDimension::D2, true) => vk::ImageViewType::TYPE_2D_ARRAY,
        (TextureDimension::D3, _) => vk::ImageViewType::TYPE_3D,
    }
}

pub(crate) fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::SampledTexture => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
    }
}

pub(crate) fn shader_stages(stages: BitFlags<ShaderStage>) -> vk::ShaderStageFlags {
    stages.iter().fold(vk::ShaderStageFlags::empty(), |acc, stage| {
        acc | match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    })
}

pub(crate) fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(crate) fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

/// Convert a timeout to what `vkWaitForFences` expects.
pub(crate) fn timeout_ns(timeout: Option<std::time::Duration>) -> u64 {
    timeout.map_or(u64::MAX, |timeout| u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_round_trip() {
        for format in [Format::R8Unorm, Format::Bgra8Srgb, Format::Rgba16Float, Format::D32Float] {
            assert_eq!(format_from_vk(vk_format(format)), Some(format));
        }
        assert_eq!(format_from_vk(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn memory_type_respects_filter() {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = 2;
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&properties, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE), Some(1));
        assert_eq!(find_memory_type(&properties, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE), None);
        assert_eq!(timeout_ns(None), u64::MAX);
    }
}
