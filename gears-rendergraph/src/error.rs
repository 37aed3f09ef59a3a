use gears_rhi::{BindingKind, RhiError, SwapchainError};

/// Misuse while assembling a [`ConnectionSet`](crate::ConnectionSet).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Node name \"{0}\" is already used in this connection set")]
    DuplicateName(String),
    #[error("Unknown {kind} node #{index}")]
    UnknownNode { kind: &'static str, index: u32 },
    #[error("{direction} binding {binding} of operation \"{operation}\" is already resolved")]
    BindingAlreadyResolved {
        operation: String,
        direction: &'static str,
        binding: u32,
    },
}

/// Failure of [`RenderGraph::compile_resources`](crate::RenderGraph::compile_resources)
/// or [`RenderGraph::compile`](crate::RenderGraph::compile).
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("Operations form a dependency cycle: {}", operations.join(" -> "))]
    Cycle { operations: Vec<String> },
    #[error("Binding {binding} of operation \"{operation}\" is not connected to any resource")]
    UnresolvedBinding { operation: String, binding: u32 },
    #[error("Operation \"{operation}\" connects binding {binding} which its pipeline does not declare")]
    UnexpectedBinding { operation: String, binding: u32 },
    #[error("Binding {binding} of operation \"{operation}\" expects {expected:?}, but \"{resource}\" can not be bound as such")]
    BindingKindMismatch {
        operation: String,
        binding: u32,
        expected: BindingKind,
        resource: String,
    },
    #[error("Binding {binding} of operation \"{operation}\" declares {expected} layers, connection provides {actual}")]
    LayerCountMismatch {
        operation: String,
        binding: u32,
        expected: u32,
        actual: u32,
    },
    #[error("Operation \"{operation}\" uses a pipeline of the wrong kind")]
    PipelineKindMismatch { operation: String },
    #[error("Render operation \"{0}\" has no image output to render into")]
    MissingRenderTarget(String),
    #[error("Operation \"{operation}\" can not write to \"{resource}\"")]
    InvalidOutput { operation: String, resource: String },
    #[error("inconsistent output image extents in operation \"{0}\"")]
    InconsistentOutputExtents(String),
    #[error("Transfer operation \"{0}\" needs exactly one image input and one image output")]
    InvalidTransfer(String),
    #[error("\"{node}\" requires the missing device feature {feature}")]
    MissingFeature { node: String, feature: &'static str },
    #[error("Resource \"{0}\" is backed by the swapchain, but the settings carry no swapchain images")]
    MissingSwapchain(String),
    #[error("Resources were not compiled before compiling the graph")]
    ResourcesNotCompiled,
    #[error(transparent)]
    Device(#[from] RhiError),
}

/// Failure while driving frames.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Acquire or present reported out of date or suboptimal. The swapchain and
    /// the graph must be recreated before the next frame.
    #[error("Swapchain is stale and needs to be recreated")]
    StaleSwapchain,
    #[error("Swapchain does not support presenting")]
    PresentingUnsupported,
    #[error("Render graph is not compiled")]
    NotCompiled,
    #[error("Frame slot {slot} is out of range for {frames_in_flight} frames in flight")]
    SlotOutOfRange { slot: usize, frames_in_flight: usize },
    #[error("Swapchain image {image_index} is out of range for {image_count} images")]
    ImageOutOfRange { image_index: u32, image_count: usize },
    #[error("Swapchain image {image_index} maps to frame slot {slot}, which does not exist")]
    SlotMappingBroken { image_index: u32, slot: usize },
    #[error("Renderer drives {renderer} frames in flight but the graph was compiled for {graph}")]
    FrameCountMismatch { renderer: usize, graph: usize },
    #[error("Resource \"{0}\" is not a CPU buffer")]
    NotCpuBuffer(String),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Device(#[from] RhiError),
}

impl RenderError {
    /// `true` when recreating the swapchain is the way out.
    pub fn is_stale(&self) -> bool {
        matches!(self, RenderError::StaleSwapchain)
    }
}

impl From<SwapchainError> for RenderError {
    fn from(value: SwapchainError) -> Self {
        match value {
            SwapchainError::OutOfDate | SwapchainError::Suboptimal => RenderError::StaleSwapchain,
            SwapchainError::PresentingUnsupported => RenderError::PresentingUnsupported,
            SwapchainError::Device(err) => RenderError::Device(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_swapchain_results_are_distinguishable() {
        assert!(RenderError::from(SwapchainError::OutOfDate).is_stale());
        assert!(RenderError::from(SwapchainError::Suboptimal).is_stale());
        assert!(!RenderError::from(SwapchainError::PresentingUnsupported).is_stale());
        assert!(!RenderError::from(SwapchainError::Device(RhiError::DeviceLost)).is_stale());
    }

    #[test]
    fn extent_error_keeps_its_message() {
        let err = CompileError::InconsistentOutputExtents("blur".to_owned());
        assert!(err.to_string().starts_with("inconsistent output image extents"));
    }
}
