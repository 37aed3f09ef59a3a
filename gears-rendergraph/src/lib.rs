//! Frame-synchronized render graph.
//!
//! A graph is assembled from [`Resource`]s and [`Operation`]s in a
//! [`ConnectionSet`], compiled into per-frame command lists by a
//! [`RenderGraph`] and driven frame by frame by a [`Renderer`].

mod compiler;
mod connection;
mod error;
mod graph;
mod operation;
mod pipeline_cache;
mod renderer;
mod resource;
mod settings;

pub use connection::{
    BindingMeta, Connection, ConnectionSet, Direction, Node, NodeId, OperationId, ResourceId,
};
pub use error::{CompileError, GraphError, RenderError};
pub use graph::{CompileReport, RenderGraph};
pub use operation::{ComputeOperation, DrawDescriptor, Operation, OperationKind, RenderOperation};
pub use pipeline_cache::PipelineCache;
pub use renderer::{
    conditional_draw_callback, infinite_draw_callback,
    BlockingRenderer, FrameEvent, FrameInfo, FrameUpdate, PreSubmit, RecreateReport, RenderContext, Renderer,
    RendererConfig, RendererConfigBuilder, RendererConfigBuilderError, StalePolicy,
    SynchronizedSwapchainRenderer, WaitPolicy,
};
pub use resource::{Backing, ImageDesc, Physical, Resource, ResourceKind};
pub use settings::{GraphSettings, GraphSettingsBuilder, GraphSettingsBuilderError, SwapchainImages};
