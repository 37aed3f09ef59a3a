/// Texel formats the render graph can allocate or receive from a swapchain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    R32Float,
    #[default]
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    D32Float,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32Float)
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::R8Unorm => 1,
            Format::R32Float
            | Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::D32Float => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{width}x{height}")]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{width}x{height}x{depth}")]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    pub fn to_2d(self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

impl Default for Extent3D {
    fn default() -> Self {
        Self::new(1, 1, 1)
    }
}

impl From<Extent2D> for Extent3D {
    fn from(value: Extent2D) -> Self {
        Self::new(value.width, value.height, 1)
    }
}
