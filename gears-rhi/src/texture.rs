//! Backend-neutral texture description.

use enumflags2::{bitflags, BitFlags};
use crate::format::{Extent3D, Format};

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    Sampled = 1 << 0,
    Storage = 1 << 1,
    ColorAttachment = 1 << 2,
    DepthStencilAttachment = 1 << 3,
    TransferSrc = 1 << 4,
    TransferDst = 1 << 5,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

/// Texture descriptor for creating GPU textures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub name: String,
    pub format: Format,
    pub extent: Extent3D,
    pub dimension: TextureDimension,
    pub array_layers: u32,
    pub usage: BitFlags<TextureUsage>,
    pub filter: Filter,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            format: Format::Rgba8Unorm,
            extent: Extent3D::default(),
            dimension: TextureDimension::D2,
            array_layers: 1,
            usage: TextureUsage::Sampled.into(),
            filter: Filter::Linear,
        }
    }
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: Format) -> Self {
        Self {
            format,
            extent: Extent3D::new(width, height, 1),
            ..Default::default()
        }
    }

    pub fn new_color_attachment(width: u32, height: u32, format: Format) -> Self {
        Self {
            format,
            extent: Extent3D::new(width, height, 1),
            usage: TextureUsage::ColorAttachment
                | TextureUsage::Sampled
                | TextureUsage::TransferSrc
                | TextureUsage::TransferDst,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_extent(mut self, width: u32, height: u32, depth: u32) -> Self {
        self.extent = Extent3D::new(width, height, depth);
        self.dimension = if depth > 1 {
            TextureDimension::D3
        } else if height > 1 {
            TextureDimension::D2
        } else {
            TextureDimension::D1
        };
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers;
        self
    }

    pub fn with_usage(mut self, usage: BitFlags<TextureUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_additional_usage(mut self, usage: impl Into<BitFlags<TextureUsage>>) -> Self {
        self.usage |= usage.into();
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}
