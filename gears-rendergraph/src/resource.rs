//! Graph resources and their physical backings.

use enumflags2::BitFlags;
use gears_rhi::{
    BufferDesc, BufferHandle, BufferState, DeviceFeatures, Extent3D, Filter, Format, TextureDesc, TextureHandle,
    TextureLayout, TextureUsage,
};

/// Size and format of a graph image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub format: Format,
    pub extent: Extent3D,
    pub layers: u32,
    pub filter: Filter,
}

impl ImageDesc {
    pub fn new_2d(width: u32, height: u32, format: Format) -> Self {
        Self {
            format,
            extent: Extent3D::new(width, height, 1),
            layers: 1,
            filter: Filter::Linear,
        }
    }

    pub fn new_1d(width: u32, format: Format) -> Self {
        Self::new_2d(width, 1, format)
    }

    pub fn new_3d(width: u32, height: u32, depth: u32, format: Format) -> Self {
        Self {
            extent: Extent3D::new(width, height, depth),
            ..Self::new_2d(width, height, format)
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    fn texture_desc(&self, name: String, usage: BitFlags<TextureUsage>) -> TextureDesc {
        TextureDesc::default()
            .with_name(name)
            .with_format(self.format)
            .with_extent(self.extent.width, self.extent.height, self.extent.depth)
            .with_array_layers(self.layers)
            .with_usage(usage)
            .with_filter(self.filter)
    }
}

/// What a resource is, independent of how many copies back it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Render target with one copy per frame in flight.
    WritableImage(ImageDesc),
    /// Render target with one copy shared by every frame.
    SingleWritableImage(ImageDesc),
    /// Sampled image filled once and never written by the graph.
    ReadOnlyImage(ImageDesc),
    /// The image acquired from the swapchain for the current frame.
    SwapchainImage,
    /// Device local uniform/storage buffer, one copy per frame in flight.
    GpuBuffer { size: u64 },
    /// Host visible buffer, one copy per frame in flight.
    CpuBuffer { size: u64 },
}

impl ResourceKind {
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            ResourceKind::WritableImage(_)
                | ResourceKind::SingleWritableImage(_)
                | ResourceKind::ReadOnlyImage(_)
                | ResourceKind::SwapchainImage
        )
    }

    pub fn is_buffer(&self) -> bool {
        !self.is_image()
    }

    /// One physical copy per frame in flight.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            ResourceKind::WritableImage(_) | ResourceKind::GpuBuffer { .. } | ResourceKind::CpuBuffer { .. }
        )
    }

    /// Physical copies needed for `frames_in_flight` frames. Swapchain images
    /// are not owned by the graph and need none.
    pub fn copies(&self, frames_in_flight: u32) -> u32 {
        match self {
            ResourceKind::SwapchainImage => 0,
            kind if kind.is_per_frame() => frames_in_flight,
            _ => 1,
        }
    }

    /// Layout images are in at the start and end of every frame.
    pub fn initial_layout(&self) -> TextureLayout {
        match self {
            ResourceKind::WritableImage(_) | ResourceKind::SingleWritableImage(_) => TextureLayout::Color,
            ResourceKind::ReadOnlyImage(_) => TextureLayout::ShaderReadOnly,
            ResourceKind::SwapchainImage | ResourceKind::GpuBuffer { .. } | ResourceKind::CpuBuffer { .. } => {
                TextureLayout::Undefined
            }
        }
    }

    /// Layout the last barrier of a frame leaves the image in.
    pub fn final_layout(&self) -> TextureLayout {
        match self {
            ResourceKind::SwapchainImage => TextureLayout::Present,
            other => other.initial_layout(),
        }
    }

    pub fn initial_buffer_state(&self) -> BufferState {
        match self {
            ResourceKind::CpuBuffer { .. } => BufferState::HostWrite,
            ResourceKind::GpuBuffer { .. } => BufferState::Storage,
            _ => BufferState::Undefined,
        }
    }

    pub(crate) fn image_desc(&self) -> Option<&ImageDesc> {
        match self {
            ResourceKind::WritableImage(desc)
            | ResourceKind::SingleWritableImage(desc)
            | ResourceKind::ReadOnlyImage(desc) => Some(desc),
            _ => None,
        }
    }

    pub(crate) fn texture_desc(&self, name: &str, copy: u32, features: DeviceFeatures) -> Option<TextureDesc> {
        let name = format!("{name} #{copy}");
        match self {
            ResourceKind::WritableImage(desc) | ResourceKind::SingleWritableImage(desc) => {
                let mut usage = TextureUsage::ColorAttachment
                    | TextureUsage::Sampled
                    | TextureUsage::TransferSrc
                    | TextureUsage::TransferDst;
                if features.storage_textures {
                    usage |= TextureUsage::Storage;
                }
                Some(desc.texture_desc(name, usage))
            }
            ResourceKind::ReadOnlyImage(desc) => {
                Some(desc.texture_desc(name, TextureUsage::Sampled | TextureUsage::TransferDst))
            }
            _ => None,
        }
    }

    pub(crate) fn buffer_desc(&self, name: &str, copy: u32) -> Option<BufferDesc> {
        let name = format!("{name} #{copy}");
        match self {
            ResourceKind::GpuBuffer { size } => Some(BufferDesc::gpu(&name, *size)),
            ResourceKind::CpuBuffer { size } => Some(BufferDesc::cpu(&name, *size)),
            _ => None,
        }
    }
}

/// A node standing for GPU memory read or written by operations.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Resource {
    name: String,
    kind: ResourceKind,
}

impl Resource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self { name: name.into(), kind }
    }

    pub fn writable_image(name: impl Into<String>, desc: ImageDesc) -> Self {
        Self::new(name, ResourceKind::WritableImage(desc))
    }

    pub fn single_writable_image(name: impl Into<String>, desc: ImageDesc) -> Self {
        Self::new(name, ResourceKind::SingleWritableImage(desc))
    }

    pub fn read_only_image(name: impl Into<String>, desc: ImageDesc) -> Self {
        Self::new(name, ResourceKind::ReadOnlyImage(desc))
    }

    pub fn swapchain_image(name: impl Into<String>) -> Self {
        Self::new(name, ResourceKind::SwapchainImage)
    }

    pub fn gpu_buffer(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, ResourceKind::GpuBuffer { size })
    }

    pub fn cpu_buffer(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, ResourceKind::CpuBuffer { size })
    }

    #[inline]
    pub fn name(&self) -> &str { &self.name }

    #[inline]
    pub fn kind(&self) -> &ResourceKind { &self.kind }
}

/// One physical allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Physical {
    Texture(TextureHandle),
    Buffer(BufferHandle),
}

impl Physical {
    pub fn texture(self) -> Option<TextureHandle> {
        match self {
            Physical::Texture(texture) => Some(texture),
            Physical::Buffer(_) => None,
        }
    }

    pub fn buffer(self) -> Option<BufferHandle> {
        match self {
            Physical::Buffer(buffer) => Some(buffer),
            Physical::Texture(_) => None,
        }
    }
}

/// How many physical copies stand behind a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    Single(Physical),
    /// Indexed by frame slot.
    Multi(Vec<Physical>),
    /// Indexed by swapchain image.
    Swapchain(Vec<TextureHandle>),
}

impl Backing {
    /// The copy used by frame `slot` rendering into swapchain image `image_index`.
    pub fn resolve(&self, slot: usize, image_index: usize) -> Option<Physical> {
        match self {
            Backing::Single(physical) => Some(*physical),
            Backing::Multi(copies) => copies.get(slot).copied(),
            Backing::Swapchain(images) => images.get(image_index).copied().map(Physical::Texture),
        }
    }

    /// Copies owned by the graph.
    pub(crate) fn owned(&self) -> impl Iterator<Item = Physical> + '_ {
        let owned: &[Physical] = match self {
            Backing::Single(physical) => std::slice::from_ref(physical),
            Backing::Multi(copies) => copies,
            Backing::Swapchain(_) => &[],
        };
        owned.iter().copied()
    }

    pub fn copy_count(&self) -> usize {
        match self {
            Backing::Single(_) => 1,
            Backing::Multi(copies) => copies.len(),
            Backing::Swapchain(images) => images.len(),
        }
    }
}
