//! Backend-neutral buffer description.

use enumflags2::{bitflags, BitFlags};

#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Uniform = 1 << 0,
    Storage = 1 << 1,
    Vertex = 1 << 2,
    TransferSrc = 1 << 3,
    TransferDst = 1 << 4,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    #[default]
    Gpu,
    /// Host visible and coherent, writable through `RenderDevice::write_buffer`.
    Cpu,
}

/// Buffer descriptor for creating GPU buffers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub name: String,
    pub size: u64,
    pub usage: BitFlags<BufferUsage>,
    pub location: MemoryLocation,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            name: "Unnamed buffer".to_string(),
            size: 0,
            usage: BitFlags::empty(),
            location: MemoryLocation::Gpu,
        }
    }
}

impl BufferDesc {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            ..Default::default()
        }
    }

    /// Device local uniform/storage buffer.
    pub fn gpu(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            usage: BufferUsage::Uniform | BufferUsage::Storage | BufferUsage::TransferSrc | BufferUsage::TransferDst,
            location: MemoryLocation::Gpu,
        }
    }

    /// Host visible storage buffer.
    pub fn cpu(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            size,
            usage: BufferUsage::Storage | BufferUsage::Uniform | BufferUsage::TransferSrc | BufferUsage::TransferDst,
            location: MemoryLocation::Cpu,
        }
    }
}
