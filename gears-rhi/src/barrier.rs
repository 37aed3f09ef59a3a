use enumflags2::BitFlags;
use crate::handle::{BufferHandle, TextureHandle};

#[enumflags2::bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    TopOfPipe = 1 << 0,
    Host = 1 << 1,
    Transfer = 1 << 2,
    VertexAttributeInput = 1 << 3,
    VertexShader = 1 << 4,
    FragmentShader = 1 << 5,
    ComputeShader = 1 << 6,
    ColorAttachmentOutput = 1 << 7,
    EarlyFragmentTests = 1 << 8,
    LateFragmentTests = 1 << 9,
    BottomOfPipe = 1 << 10,
    AllCommands = 1 << 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineStages(BitFlags<PipelineStage>);

impl PipelineStages {
    pub fn empty() -> Self {
        Self(BitFlags::empty())
    }

    pub fn insert(&mut self, stage: PipelineStage) {
        self.0.insert(stage);
    }

    pub fn contains(&self, stage: PipelineStage) -> bool {
        self.0.contains(stage)
    }

    pub fn iter(&self) -> impl Iterator<Item = PipelineStage> + '_ {
        self.0.iter()
    }
}

impl From<PipelineStage> for PipelineStages {
    fn from(value: PipelineStage) -> Self {
        Self(BitFlags::from_flag(value))
    }
}

impl core::ops::BitOr for PipelineStages {
    type Output = PipelineStages;
    fn bitor(self, rhs: PipelineStages) -> Self::Output {
        PipelineStages(self.0 | rhs.0)
    }
}

impl core::ops::BitOr<PipelineStage> for PipelineStages {
    type Output = PipelineStages;
    fn bitor(self, rhs: PipelineStage) -> Self::Output {
        PipelineStages(self.0 | rhs)
    }
}

impl core::ops::BitOrAssign for PipelineStages {
    fn bitor_assign(&mut self, rhs: PipelineStages) {
        self.0 |= rhs.0;
    }
}

/// Layout an image has to be in for a given kind of access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureLayout {
    Undefined,
    General,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
    Color,
    DepthStencil,
    Present,
}

impl TextureLayout {
    /// Stages that touch an image while it sits in this layout.
    pub fn pipeline_stages(self) -> PipelineStages {
        match self {
            TextureLayout::Undefined => PipelineStage::TopOfPipe.into(),
            TextureLayout::General => PipelineStage::AllCommands.into(),
            TextureLayout::TransferSrc |
            TextureLayout::TransferDst => PipelineStage::Transfer.into(),
            TextureLayout::ShaderReadOnly => PipelineStages::from(PipelineStage::FragmentShader) | PipelineStage::ComputeShader,
            TextureLayout::Color => PipelineStage::ColorAttachmentOutput.into(),
            TextureLayout::DepthStencil => PipelineStages::from(PipelineStage::EarlyFragmentTests) | PipelineStage::LateFragmentTests,
            TextureLayout::Present => PipelineStage::BottomOfPipe.into(),
        }
    }

    pub fn is_read_only(self) -> bool {
        matches!(self, TextureLayout::TransferSrc | TextureLayout::ShaderReadOnly | TextureLayout::Present)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferState {
    Undefined,
    HostWrite,
    TransferSrc,
    TransferDst,
    Uniform,
    Storage,
    Vertex,
}

impl BufferState {
    pub fn pipeline_stages(self) -> PipelineStages {
        match self {
            BufferState::Undefined => PipelineStage::TopOfPipe.into(),
            BufferState::HostWrite => PipelineStage::Host.into(),
            BufferState::TransferSrc |
            BufferState::TransferDst => PipelineStage::Transfer.into(),
            BufferState::Uniform |
            BufferState::Storage => PipelineStages::from(PipelineStage::VertexShader)
                | PipelineStage::FragmentShader
                | PipelineStage::ComputeShader,
            BufferState::Vertex => PipelineStage::VertexAttributeInput.into(),
        }
    }
}

/// Image layout transition recorded into a command list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureBarrier {
    pub texture: TextureHandle,
    pub old_layout: TextureLayout,
    pub new_layout: TextureLayout,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    /// Previous contents may be thrown away.
    pub discard: bool,
}

impl TextureBarrier {
    pub fn new(texture: TextureHandle, old_layout: TextureLayout, new_layout: TextureLayout) -> Self {
        Self {
            texture,
            old_layout,
            new_layout,
            src_stage: old_layout.pipeline_stages(),
            dst_stage: new_layout.pipeline_stages(),
            discard: old_layout == TextureLayout::Undefined,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_state: BufferState,
    pub dst_state: BufferState,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
}

impl BufferBarrier {
    pub fn new(buffer: BufferHandle, src_state: BufferState, dst_state: BufferState) -> Self {
        Self {
            buffer,
            src_state,
            dst_state,
            src_stage: src_state.pipeline_stages(),
            dst_stage: dst_state.pipeline_stages(),
        }
    }
}

#[cfg(feature = "vulkan")]
mod vk_conversion {
    use ash::vk;
    use super::*;

    impl PipelineStage {
        pub fn to_vk(self) -> vk::PipelineStageFlags2 {
            match self {
                PipelineStage::TopOfPipe => vk::PipelineStageFlags2::TOP_OF_PIPE,
                PipelineStage::Host => vk::PipelineStageFlags2::HOST,
                PipelineStage::Transfer => vk::PipelineStageFlags2::TRANSFER,
                PipelineStage::VertexAttributeInput => vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
                PipelineStage::VertexShader => vk::PipelineStageFlags2::VERTEX_SHADER,
                PipelineStage::FragmentShader => vk::PipelineStageFlags2::FRAGMENT_SHADER,
                PipelineStage::ComputeShader => vk::PipelineStageFlags2::COMPUTE_SHADER,
                PipelineStage::ColorAttachmentOutput => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                PipelineStage::EarlyFragmentTests => vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
                PipelineStage::LateFragmentTests => vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                PipelineStage::BottomOfPipe => vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                PipelineStage::AllCommands => vk::PipelineStageFlags2::ALL_COMMANDS,
            }
        }
    }

    impl PipelineStages {
        pub fn to_vk(self) -> vk::PipelineStageFlags2 {
            self.0.iter()
                .fold(vk::PipelineStageFlags2::empty(), |acc, s| acc | s.to_vk())
        }
    }

    impl TextureLayout {
        pub fn to_vk(self) -> vk::ImageLayout {
            match self {
                TextureLayout::Undefined => vk::ImageLayout::UNDEFINED,
                TextureLayout::General => vk::ImageLayout::GENERAL,
                TextureLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                TextureLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                TextureLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                TextureLayout::Color => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                TextureLayout::DepthStencil => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                TextureLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            }
        }

        pub fn access_flags(self) -> vk::AccessFlags2 {
            match self {
                TextureLayout::Undefined => vk::AccessFlags2::NONE,
                TextureLayout::General => vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
                TextureLayout::TransferSrc => vk::AccessFlags2::TRANSFER_READ,
                TextureLayout::TransferDst => vk::AccessFlags2::TRANSFER_WRITE,
                TextureLayout::ShaderReadOnly => vk::AccessFlags2::SHADER_SAMPLED_READ,
                TextureLayout::Color => vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                TextureLayout::DepthStencil => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                TextureLayout::Present => vk::AccessFlags2::NONE,
            }
        }
    }

    impl BufferState {
        pub fn access_flags(self) -> vk::AccessFlags2 {
            match self {
                BufferState::Undefined => vk::AccessFlags2::NONE,
                BufferState::HostWrite => vk::AccessFlags2::HOST_WRITE,
                BufferState::TransferSrc => vk::AccessFlags2::TRANSFER_READ,
                BufferState::TransferDst => vk::AccessFlags2::TRANSFER_WRITE,
                BufferState::Uniform => vk::AccessFlags2::UNIFORM_READ,
                BufferState::Storage => vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                BufferState::Vertex => vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    #[test]
    fn undefined_source_discards() {
        let texture = TextureHandle::from(KeyData::from_ffi(1));
        let barrier = TextureBarrier::new(texture, TextureLayout::Undefined, TextureLayout::Color);
        assert!(barrier.discard);
        assert!(barrier.dst_stage.contains(PipelineStage::ColorAttachmentOutput));

        let barrier = TextureBarrier::new(texture, TextureLayout::Color, TextureLayout::Present);
        assert!(!barrier.discard);
        assert!(barrier.src_stage.contains(PipelineStage::ColorAttachmentOutput));
        assert!(barrier.dst_stage.contains(PipelineStage::BottomOfPipe));
    }

    #[test]
    fn sampled_layout_covers_fragment_and_compute() {
        let stages = TextureLayout::ShaderReadOnly.pipeline_stages();
        assert!(stages.contains(PipelineStage::FragmentShader));
        assert!(stages.contains(PipelineStage::ComputeShader));
        assert!(!stages.contains(PipelineStage::Transfer));
    }
}
